//! Inner frame codec: `[type:u8][len:u32 LE][payload]`.

use serde::Serialize;

use crate::error::ProtocolError;
use crate::protocol::message::MessageType;

/// Maximum accepted payload size, 16 MiB.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// One decoded control-plane frame.
///
/// The type tag is kept as a raw byte so that frames with tags this build
/// does not know about can still be carried (and skipped) by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type tag byte.
    pub kind: u8,
    /// UTF-8 JSON payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Builds a frame from a message type and an already-encoded payload.
    #[must_use]
    pub fn new(kind: MessageType, payload: Vec<u8>) -> Self {
        Self {
            kind: kind as u8,
            payload,
        }
    }

    /// Builds a frame by serializing `body` as the JSON payload.
    ///
    /// # Panics
    ///
    /// Panics if `body` fails to serialize, which cannot happen for the
    /// derive-based payload types in [`super::message`].
    #[must_use]
    pub fn json<T: Serialize>(kind: MessageType, body: &T) -> Self {
        let payload = serde_json::to_vec(body).expect("payload types always serialize");
        Self::new(kind, payload)
    }

    /// The typed view of the tag byte, if this build knows it.
    #[must_use]
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u8(self.kind)
    }

    /// Encodes the frame into its wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.payload.len());
        out.push(self.kind);
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decodes a frame from `bytes`.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::TooShort`] if fewer than 5 bytes are available.
    /// - [`ProtocolError::LengthMismatch`] if the declared length does not
    ///   equal the remaining byte count.
    /// - [`ProtocolError::PayloadTooLarge`] above the 16 MiB cap.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < 5 {
            return Err(ProtocolError::TooShort { len: bytes.len() });
        }

        let kind = bytes[0];
        let declared = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;

        if declared > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge { len: declared });
        }

        let actual = bytes.len() - 5;
        if declared != actual {
            return Err(ProtocolError::LengthMismatch { declared, actual });
        }

        Ok(Self {
            kind,
            payload: bytes[5..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let frame = Frame::new(MessageType::Spawned, br#"{"id":7}"#.to_vec());
        let decoded = Frame::decode(&frame.encode()).expect("frame should decode");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_encoding_layout() {
        let payload = br#"{"id":7,"pid":123,"handle":"proc-0"}"#.to_vec();
        let bytes = Frame::new(MessageType::Spawned, payload.clone()).encode();

        assert_eq!(bytes[0], 0x81);
        assert_eq!(&bytes[1..5], &(payload.len() as u32).to_le_bytes());
        assert_eq!(&bytes[5..], &payload[..]);
    }

    #[test]
    fn test_empty_payload() {
        let bytes = Frame::new(MessageType::Ping, Vec::new()).encode();
        assert_eq!(bytes, vec![0xF0, 0, 0, 0, 0]);

        let decoded = Frame::decode(&bytes).expect("empty payload should decode");
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_too_short() {
        assert!(matches!(
            Frame::decode(&[0x81, 0x00]),
            Err(ProtocolError::TooShort { len: 2 })
        ));
        assert!(matches!(
            Frame::decode(&[]),
            Err(ProtocolError::TooShort { len: 0 })
        ));
    }

    #[test]
    fn test_length_mismatch() {
        // Header declares 4 payload bytes but only 2 follow.
        let bytes = [0x81, 4, 0, 0, 0, b'{', b'}'];
        assert!(matches!(
            Frame::decode(&bytes),
            Err(ProtocolError::LengthMismatch {
                declared: 4,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_payload_too_large() {
        let mut bytes = vec![0x81];
        bytes.extend_from_slice(&((MAX_PAYLOAD as u32) + 1).to_le_bytes());
        assert!(matches!(
            Frame::decode(&bytes),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_unknown_type_is_carried() {
        let frame = Frame {
            kind: 0x7E,
            payload: b"{}".to_vec(),
        };
        let decoded = Frame::decode(&frame.encode()).expect("unknown tag should still decode");
        assert_eq!(decoded.kind, 0x7E);
        assert!(decoded.message_type().is_none());
    }
}
