//! Per-connection message dispatch.
//!
//! Each accepted socket gets one worker running the read loop and one
//! writer task owning the WebSocket write half. Handlers and the
//! forwarder/reaper tasks all post frames through the writer channel, which
//! serializes writes at frame granularity. Handler failures become `error`
//! frames; only transport errors end the connection.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::fsops;
use crate::protocol::message::{
    self as wire, BinaryInstallRequest, DataReply, ErrorReply, FsReadRequest, IsRunningRequest,
    KillRequest, MessageType, MountRequest, ResizeRequest, SessionCreateRequest,
    SessionDestroyRequest, SpawnRequest, StdinRequest, UnmountRequest,
};
use crate::protocol::{Frame, ws};
use crate::server::Daemon;
use crate::supervisor::FrameSender;

/// Drives one connection from handshake to close.
pub async fn serve(stream: TcpStream, daemon: Arc<Daemon>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    if let Err(err) = ws::server_handshake(&mut reader, &mut write_half).await {
        warn!(%err, "Handshake failed");
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(err) = ws::write_frame(&mut write_half, &frame.encode(), false).await {
                debug!(%err, "Write half closed");
                break;
            }
        }
    });

    loop {
        match ws::read_frame(&mut reader).await {
            Ok(Some(bytes)) => match Frame::decode(&bytes) {
                Ok(frame) => dispatch(frame, &daemon, &tx).await,
                Err(err) => debug!(%err, "Dropping undecodable frame"),
            },
            Ok(None) => break,
            Err(err) => {
                debug!(%err, "Read loop ending");
                break;
            }
        }
    }

    // Dropping the sender lets the writer drain pending frames and stop.
    drop(tx);
    let _ = writer.await;
}

/// Decodes the payload for a handler, answering `INVALID_PARAMS` when the
/// JSON does not fit the schema.
fn parse<T: DeserializeOwned>(frame: &Frame, out: &FrameSender) -> Option<T> {
    match serde_json::from_slice(&frame.payload) {
        Ok(body) => Some(body),
        Err(err) => {
            let id = serde_json::from_slice::<serde_json::Value>(&frame.payload)
                .ok()
                .and_then(|value| value.get("id")?.as_u64())
                .unwrap_or(0) as u32;
            send_error(out, id, wire::INVALID_PARAMS, &err.to_string());
            None
        }
    }
}

fn send_error(out: &FrameSender, id: u32, code: i32, message: &str) {
    let _ = out.send(Frame::json(
        MessageType::Error,
        &ErrorReply {
            id,
            code,
            message: message.to_string(),
        },
    ));
}

fn send_ok(out: &FrameSender) {
    let _ = out.send(Frame::new(MessageType::Ok, b"{}".to_vec()));
}

async fn dispatch(frame: Frame, daemon: &Arc<Daemon>, out: &FrameSender) {
    let Some(kind) = frame.message_type() else {
        trace!(kind = frame.kind, "Ignoring unknown message type");
        return;
    };

    match kind {
        MessageType::Ping => {
            let _ = out.send(Frame::new(MessageType::Pong, b"{}".to_vec()));
        }

        MessageType::Spawn => {
            let Some(req) = parse::<SpawnRequest>(&frame, out) else {
                return;
            };
            match Arc::clone(&daemon.supervisor).spawn(&req, out.clone()) {
                Ok(reply) => {
                    let _ = out.send(Frame::json(MessageType::Spawned, &reply));
                }
                Err(err) => {
                    warn!(%err, command = %req.command, "Spawn failed");
                    send_error(out, req.id, wire::SPAWN_FAILED, &err.to_string());
                }
            }
        }

        MessageType::Stdin => {
            let Some(req) = parse::<StdinRequest>(&frame, out) else {
                return;
            };
            daemon.supervisor.write_stdin(&req.handle, req.data.as_bytes());
        }

        MessageType::Kill => {
            let Some(req) = parse::<KillRequest>(&frame, out) else {
                return;
            };
            daemon.supervisor.kill(&req.handle, req.signal);
        }

        MessageType::Resize => {
            let Some(req) = parse::<ResizeRequest>(&frame, out) else {
                return;
            };
            daemon.supervisor.resize(&req.handle, req.rows, req.cols);
        }

        MessageType::Mount => {
            let Some(req) = parse::<MountRequest>(&frame, out) else {
                return;
            };
            match fsops::mount(&req.tag, &req.mount_point, req.read_only).await {
                Ok(()) => send_ok(out),
                Err(err) => {
                    let code = Error::from(err).wire_code();
                    send_error(out, 0, code, "mount failed");
                }
            }
        }

        MessageType::Unmount => {
            let Some(req) = parse::<UnmountRequest>(&frame, out) else {
                return;
            };
            match fsops::unmount(&req.mount_point).await {
                Ok(()) => send_ok(out),
                Err(err) => {
                    let code = Error::from(err).wire_code();
                    send_error(out, 0, code, "unmount failed");
                }
            }
        }

        MessageType::SessionCreate => {
            let Some(req) = parse::<SessionCreateRequest>(&frame, out) else {
                return;
            };
            let sessions = Arc::clone(&daemon.sessions);
            let result =
                task::spawn_blocking(move || sessions.create(req.uid, req.username.as_deref()))
                    .await;
            match result {
                Ok(Ok(reply)) => {
                    let _ = out.send(Frame::json(MessageType::Ok, &reply));
                }
                Ok(Err(err)) => {
                    warn!(%err, "Session create failed");
                    let message = err.to_string();
                    send_error(out, 0, Error::from(err).wire_code(), &message);
                }
                Err(join_err) => {
                    send_error(out, 0, wire::INTERNAL_ERROR, &join_err.to_string());
                }
            }
        }

        MessageType::SessionDestroy => {
            let Some(req) = parse::<SessionDestroyRequest>(&frame, out) else {
                return;
            };
            let sessions = Arc::clone(&daemon.sessions);
            let result =
                task::spawn_blocking(move || sessions.destroy(req.uid, req.delete_home)).await;
            match result {
                Ok(Ok(())) => send_ok(out),
                Ok(Err(err)) => {
                    let message = err.to_string();
                    send_error(out, 0, Error::from(err).wire_code(), &message);
                }
                Err(join_err) => {
                    send_error(out, 0, wire::INTERNAL_ERROR, &join_err.to_string());
                }
            }
        }

        MessageType::BinaryInstall => {
            let Some(req) = parse::<BinaryInstallRequest>(&frame, out) else {
                return;
            };
            match fsops::install_binary(&daemon.bin_dir, &req.name, &req.data, req.executable) {
                Ok(_) => send_ok(out),
                Err(err) => {
                    warn!(%err, name = %req.name, "Install failed");
                    let message = err.to_string();
                    send_error(out, 0, Error::from(err).wire_code(), &message);
                }
            }
        }

        MessageType::FsRead | MessageType::LoadState => {
            let Some(req) = parse::<FsReadRequest>(&frame, out) else {
                return;
            };
            match fsops::read_file(&req.path) {
                Ok(contents) => {
                    use base64::Engine;
                    let data = base64::engine::general_purpose::STANDARD.encode(contents);
                    let _ = out.send(Frame::json(MessageType::Data, &DataReply { data }));
                }
                Err(err) => {
                    let message = err.to_string();
                    send_error(out, 0, Error::from(err).wire_code(), &message);
                }
            }
        }

        MessageType::IsRunning => {
            let Some(req) = parse::<IsRunningRequest>(&frame, out) else {
                return;
            };
            let status = daemon.supervisor.status(&req.handle);
            let _ = out.send(Frame::json(MessageType::RunningStatus, &status));
        }

        // Response-direction and keepalive-reply types carry nothing for
        // the daemon to do.
        _ => trace!(?kind, "Ignoring non-request message"),
    }
}
