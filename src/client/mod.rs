//! Host-side client for the guest control daemon.
//!
//! [`VmClient`] owns a WebSocket connection and a background reader task.
//! `spawn` is the only request the daemon answers with a correlating id, so
//! it synchronizes through a per-call oneshot; the id-less `ok`/`data`/
//! `pong` replies resolve a single pending-reply slot; everything else
//! (`stdout`, `stderr`, `exit`, uncorrelated `error`) surfaces on a typed
//! event stream the caller drains.
//!
//! # Example
//!
//! ```no_run
//! use vmsandbox::client::{ClientEvent, VmClient};
//!
//! # async fn demo() -> vmsandbox::error::Result<()> {
//! let mut client = VmClient::connect("127.0.0.1", 8080).await?;
//! let mut events = client.take_events().expect("first take");
//!
//! let spawned = client.spawn("/bin/echo", &["hi".into()]).await?;
//! while let Some(event) = events.recv().await {
//!     if let ClientEvent::Exit { id, code, .. } = event {
//!         assert_eq!(id, spawned.id);
//!         assert_eq!(code, 0);
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, instrument, trace, warn};

use crate::error::{Error, ProtocolError};
use crate::protocol::message::{
    BinaryInstallRequest, DataReply, ErrorReply, ExitEvent, FsReadRequest, IsRunningRequest,
    KillRequest, MessageType, OutputEvent, RunningStatusReply, SpawnRequest, SpawnedReply,
    StdinRequest,
};
use crate::protocol::{Frame, ws};

/// Frames the daemon pushes outside of request/reply correlation.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Stdout { id: u32, data: String },
    Stderr { id: u32, data: String },
    Exit { id: u32, code: i32, signal: Option<i32> },
    Error { id: u32, code: i32, message: String },
}

/// A reply resolved through the pending-reply slot.
#[derive(Debug)]
enum Reply {
    Ok(Vec<u8>),
    Data(String),
    Pong,
    RunningStatus(RunningStatusReply),
    Err(ErrorReply),
}

type PendingSpawn = Option<(u32, oneshot::Sender<Result<SpawnedReply, ErrorReply>>)>;
type PendingReply = Option<oneshot::Sender<Reply>>;

#[derive(Default)]
struct Correlation {
    spawn: std::sync::Mutex<PendingSpawn>,
    reply: std::sync::Mutex<PendingReply>,
}

/// Client half of the control protocol.
pub struct VmClient {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    correlation: Arc<Correlation>,
    events: Option<mpsc::UnboundedReceiver<ClientEvent>>,
    next_id: AtomicU32,
    reader_task: tokio::task::JoinHandle<()>,
}

impl VmClient {
    /// Connects to the daemon and completes the WebSocket handshake.
    ///
    /// # Errors
    ///
    /// Returns connection and handshake failures.
    #[instrument]
    pub async fn connect(host: &str, port: u16) -> Result<Self, Error> {
        let stream = TcpStream::connect((host, port)).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        ws::client_handshake(&mut reader, &mut write_half, host, port).await?;
        debug!(host, port, "Connected to control daemon");

        let correlation = Arc::new(Correlation::default());
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let reader_task = tokio::spawn(read_loop(reader, Arc::clone(&correlation), event_tx));

        Ok(Self {
            writer: Arc::new(Mutex::new(write_half)),
            correlation,
            events: Some(event_rx),
            next_id: AtomicU32::new(1),
            reader_task,
        })
    }

    /// Takes the event stream. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.events.take()
    }

    /// Allocates the next request id.
    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(&self, frame: Frame) -> Result<(), Error> {
        let mut writer = self.writer.lock().await;
        ws::write_frame(&mut *writer, &frame.encode(), true).await?;
        Ok(())
    }

    async fn request_reply(&self, frame: Frame) -> Result<Reply, Error> {
        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self.correlation.reply.lock().expect("reply slot poisoned");
            *slot = Some(tx);
        }
        self.send(frame).await?;
        rx.await.map_err(|_| {
            Error::Protocol(ProtocolError::Handshake {
                reason: String::from("connection closed awaiting reply"),
            })
        })
    }

    /// Sends `ping` and waits for `pong`.
    ///
    /// # Errors
    ///
    /// Returns transport failures or an error frame from the daemon.
    pub async fn ping(&self) -> Result<(), Error> {
        match self
            .request_reply(Frame::new(MessageType::Ping, b"{}".to_vec()))
            .await?
        {
            Reply::Pong => Ok(()),
            other => Err(unexpected_reply("pong", &other)),
        }
    }

    /// Spawns a sandboxed process (network disabled, isolation helper on).
    ///
    /// # Errors
    ///
    /// Returns the daemon's `error` reply or transport failures. Blocks
    /// until the correlated reply arrives; there is no timeout.
    pub async fn spawn(&self, command: &str, args: &[String]) -> Result<SpawnedReply, Error> {
        self.spawn_request(command, args, false, false).await
    }

    /// Spawns with networking enabled, bypassing the sandbox.
    ///
    /// # Errors
    ///
    /// See [`VmClient::spawn`].
    pub async fn spawn_raw(&self, command: &str, args: &[String]) -> Result<SpawnedReply, Error> {
        self.spawn_request(command, args, true, false).await
    }

    /// Spawns with a PTY attached (sandboxed unless `network`).
    ///
    /// # Errors
    ///
    /// See [`VmClient::spawn`].
    pub async fn spawn_pty(
        &self,
        command: &str,
        args: &[String],
        network: bool,
    ) -> Result<SpawnedReply, Error> {
        self.spawn_request(command, args, network, true).await
    }

    async fn spawn_request(
        &self,
        command: &str,
        args: &[String],
        network: bool,
        pty: bool,
    ) -> Result<SpawnedReply, Error> {
        let id = self.next_id();
        let req = SpawnRequest {
            id,
            command: command.to_string(),
            args: args.to_vec(),
            cwd: None,
            uid: None,
            gid: None,
            network,
            pty,
            seccomp_profile: String::from("default"),
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self.correlation.spawn.lock().expect("spawn slot poisoned");
            *slot = Some((id, tx));
        }

        self.send(Frame::json(MessageType::Spawn, &req)).await?;
        trace!(id, command, "Awaiting spawned reply");

        let reply = rx.await.map_err(|_| {
            Error::Protocol(ProtocolError::Handshake {
                reason: String::from("connection closed awaiting spawn reply"),
            })
        })?;
        reply.map_err(|err| {
            Error::Protocol(ProtocolError::InvalidPayload {
                reason: format!("spawn failed ({}): {}", err.code, err.message),
            })
        })
    }

    /// Forwards bytes to a child's stdin.
    ///
    /// # Errors
    ///
    /// Returns transport failures; the daemon sends no reply.
    pub async fn send_stdin(&self, id: u32, handle: &str, data: &str) -> Result<(), Error> {
        let req = StdinRequest {
            id,
            handle: handle.to_string(),
            data: data.to_string(),
        };
        self.send(Frame::json(MessageType::Stdin, &req)).await
    }

    /// Sends a signal to a child.
    ///
    /// # Errors
    ///
    /// Returns transport failures; the daemon sends no reply.
    pub async fn kill(&self, handle: &str, signal: i32) -> Result<(), Error> {
        let req = KillRequest {
            handle: handle.to_string(),
            signal,
        };
        self.send(Frame::json(MessageType::Kill, &req)).await
    }

    /// Asks whether a child is still running.
    ///
    /// # Errors
    ///
    /// Returns transport failures or an unexpected reply type.
    pub async fn is_running(&self, handle: &str) -> Result<RunningStatusReply, Error> {
        let req = IsRunningRequest {
            handle: handle.to_string(),
        };
        match self
            .request_reply(Frame::json(MessageType::IsRunning, &req))
            .await?
        {
            Reply::RunningStatus(status) => Ok(status),
            other => Err(unexpected_reply("running_status", &other)),
        }
    }

    /// Installs a binary into the guest's `/usr/local/bin`.
    ///
    /// # Errors
    ///
    /// Returns the daemon's `error` reply or transport failures.
    pub async fn install(&self, name: &str, contents: &[u8], executable: bool) -> Result<(), Error> {
        use base64::Engine;
        let req = BinaryInstallRequest {
            name: name.to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(contents),
            executable,
        };
        match self
            .request_reply(Frame::json(MessageType::BinaryInstall, &req))
            .await?
        {
            Reply::Ok(_) => Ok(()),
            Reply::Err(err) => Err(error_reply(err)),
            other => Err(unexpected_reply("ok", &other)),
        }
    }

    /// Reads a guest file (at most 100 MiB) and returns its bytes.
    ///
    /// # Errors
    ///
    /// Returns the daemon's `error` reply, decode failures, or transport
    /// failures.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, Error> {
        use base64::Engine;
        let req = FsReadRequest {
            path: path.to_string(),
        };
        match self
            .request_reply(Frame::json(MessageType::FsRead, &req))
            .await?
        {
            Reply::Data(data) => base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|e| {
                    Error::Protocol(ProtocolError::InvalidPayload {
                        reason: format!("undecodable data reply: {e}"),
                    })
                }),
            Reply::Err(err) => Err(error_reply(err)),
            other => Err(unexpected_reply("data", &other)),
        }
    }

    /// Closes the connection and stops the reader task.
    pub async fn close(self) {
        self.reader_task.abort();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

fn unexpected_reply(wanted: &str, got: &Reply) -> Error {
    Error::Protocol(ProtocolError::InvalidPayload {
        reason: format!("expected {wanted} reply, got {got:?}"),
    })
}

fn error_reply(err: ErrorReply) -> Error {
    Error::Protocol(ProtocolError::InvalidPayload {
        reason: format!("daemon error ({}): {}", err.code, err.message),
    })
}

/// Background reader: resolves correlated replies and forwards the rest as
/// events.
async fn read_loop(
    mut reader: BufReader<OwnedReadHalf>,
    correlation: Arc<Correlation>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    loop {
        let bytes = match ws::read_frame(&mut reader).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("Daemon sent close");
                break;
            }
            Err(err) => {
                debug!(%err, "Reader stopping");
                break;
            }
        };

        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "Dropping undecodable frame");
                continue;
            }
        };

        match frame.message_type() {
            Some(MessageType::Spawned) => {
                let Ok(reply) = serde_json::from_slice::<SpawnedReply>(&frame.payload) else {
                    continue;
                };
                let mut slot = correlation.spawn.lock().expect("spawn slot poisoned");
                match slot.take() {
                    Some((id, tx)) if id == reply.id => {
                        let _ = tx.send(Ok(reply));
                    }
                    other => {
                        *slot = other;
                        trace!(id = reply.id, "uncorrelated spawned reply dropped");
                    }
                }
            }

            Some(MessageType::Error) => {
                let Ok(reply) = serde_json::from_slice::<ErrorReply>(&frame.payload) else {
                    continue;
                };
                // A matching spawn waiter wins; then the pending-reply
                // slot; otherwise the caller sees it as an event.
                {
                    let mut slot = correlation.spawn.lock().expect("spawn slot poisoned");
                    match slot.take() {
                        Some((id, tx)) if id == reply.id => {
                            let _ = tx.send(Err(reply));
                            continue;
                        }
                        other => *slot = other,
                    }
                }
                if let Some(tx) = correlation.reply.lock().expect("reply slot poisoned").take() {
                    let _ = tx.send(Reply::Err(reply));
                    continue;
                }
                let _ = events.send(ClientEvent::Error {
                    id: reply.id,
                    code: reply.code,
                    message: reply.message,
                });
            }

            Some(MessageType::Ok) => {
                resolve_reply(&correlation, Reply::Ok(frame.payload.clone()));
            }
            Some(MessageType::Pong) => {
                resolve_reply(&correlation, Reply::Pong);
            }
            Some(MessageType::Data) => {
                if let Ok(reply) = serde_json::from_slice::<DataReply>(&frame.payload) {
                    resolve_reply(&correlation, Reply::Data(reply.data));
                }
            }
            Some(MessageType::RunningStatus) => {
                if let Ok(reply) = serde_json::from_slice::<RunningStatusReply>(&frame.payload) {
                    resolve_reply(&correlation, Reply::RunningStatus(reply));
                }
            }

            Some(MessageType::Stdout) => {
                if let Ok(event) = serde_json::from_slice::<OutputEvent>(&frame.payload) {
                    let _ = events.send(ClientEvent::Stdout {
                        id: event.id,
                        data: event.data,
                    });
                }
            }
            Some(MessageType::Stderr) => {
                if let Ok(event) = serde_json::from_slice::<OutputEvent>(&frame.payload) {
                    let _ = events.send(ClientEvent::Stderr {
                        id: event.id,
                        data: event.data,
                    });
                }
            }
            Some(MessageType::Exit) => {
                if let Ok(event) = serde_json::from_slice::<ExitEvent>(&frame.payload) {
                    let _ = events.send(ClientEvent::Exit {
                        id: event.id,
                        code: event.code,
                        signal: event.signal,
                    });
                }
            }

            _ => trace!(kind = frame.kind, "Ignoring frame"),
        }
    }

    // Wake any waiter so callers do not hang on a dead connection.
    correlation.spawn.lock().expect("spawn slot poisoned").take();
    correlation.reply.lock().expect("reply slot poisoned").take();
}

fn resolve_reply(correlation: &Correlation, reply: Reply) {
    let mut slot = correlation.reply.lock().expect("reply slot poisoned");
    if let Some(tx) = slot.take() {
        let _ = tx.send(reply);
    } else {
        trace!("reply with no waiter dropped");
    }
}
