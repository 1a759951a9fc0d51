//! The control-plane wire protocol.
//!
//! Two layers are defined here:
//!
//! - The **inner frame**: `[type:u8][len:u32 LE][payload]`, where the payload
//!   is a UTF-8 JSON object whose schema is fixed per type ([`message`]).
//! - The **outer transport**: binary WebSocket frames over TCP ([`ws`]),
//!   including both sides of the RFC 6455 handshake.
//!
//! The same codec is used by the guest daemon and the host client; only the
//! masking direction differs.

pub mod frame;
pub mod message;
pub mod ws;

pub use frame::Frame;
pub use message::MessageType;
