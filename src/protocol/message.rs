//! Typed messages carried by the inner frames.
//!
//! Each message type has a fixed JSON payload schema. Optional request
//! fields default per the protocol: `args` to `[]`, `network` and `pty` to
//! `false`, `seccomp_profile` to `"default"`, `signal` to `15`.

use serde::{Deserialize, Serialize};

// JSON-RPC-style error codes.
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const SPAWN_FAILED: i32 = -32000;
pub const PROCESS_NOT_FOUND: i32 = -32001;
pub const MOUNT_FAILED: i32 = -32002;
pub const USER_CREATE_FAILED: i32 = -32003;
pub const INSTALL_FAILED: i32 = -32004;

/// Message type tags.
///
/// Requests are 0x01-0x0C, responses 0x81-0x89, and the keepalive pair is
/// bidirectional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Spawn = 0x01,
    Stdin = 0x02,
    Kill = 0x03,
    Resize = 0x04,
    Mount = 0x05,
    Unmount = 0x06,
    SessionCreate = 0x07,
    BinaryInstall = 0x08,
    FsRead = 0x09,
    LoadState = 0x0A,
    IsRunning = 0x0B,
    SessionDestroy = 0x0C,
    Spawned = 0x81,
    Stdout = 0x82,
    Stderr = 0x83,
    Exit = 0x84,
    Error = 0x85,
    Ok = 0x86,
    Data = 0x87,
    RunningStatus = 0x88,
    NetworkStatus = 0x89,
    Ping = 0xF0,
    Pong = 0xF1,
}

impl MessageType {
    /// Maps a tag byte to its message type, or `None` for unknown tags.
    #[must_use]
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x01 => Self::Spawn,
            0x02 => Self::Stdin,
            0x03 => Self::Kill,
            0x04 => Self::Resize,
            0x05 => Self::Mount,
            0x06 => Self::Unmount,
            0x07 => Self::SessionCreate,
            0x08 => Self::BinaryInstall,
            0x09 => Self::FsRead,
            0x0A => Self::LoadState,
            0x0B => Self::IsRunning,
            0x0C => Self::SessionDestroy,
            0x81 => Self::Spawned,
            0x82 => Self::Stdout,
            0x83 => Self::Stderr,
            0x84 => Self::Exit,
            0x85 => Self::Error,
            0x86 => Self::Ok,
            0x87 => Self::Data,
            0x88 => Self::RunningStatus,
            0x89 => Self::NetworkStatus,
            0xF0 => Self::Ping,
            0xF1 => Self::Pong,
            _ => return None,
        })
    }
}

fn default_signal() -> i32 {
    15
}

fn default_profile() -> String {
    String::from("default")
}

fn default_executable() -> bool {
    true
}

/// `spawn` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub id: u32,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(default)]
    pub network: bool,
    #[serde(default)]
    pub pty: bool,
    #[serde(default = "default_profile")]
    pub seccomp_profile: String,
}

/// `stdin` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StdinRequest {
    pub id: u32,
    pub handle: String,
    pub data: String,
}

/// `kill` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillRequest {
    pub handle: String,
    #[serde(default = "default_signal")]
    pub signal: i32,
}

/// `resize` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub handle: String,
    pub rows: u16,
    pub cols: u16,
}

/// `mount` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountRequest {
    pub tag: String,
    pub mount_point: String,
    #[serde(default)]
    pub read_only: bool,
}

/// `unmount` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmountRequest {
    pub mount_point: String,
}

/// `session_create` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreateRequest {
    pub uid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// `session_destroy` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDestroyRequest {
    pub uid: u32,
    #[serde(default)]
    pub delete_home: bool,
}

/// `binary_install` request payload. `data` is base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryInstallRequest {
    pub name: String,
    pub data: String,
    #[serde(default = "default_executable")]
    pub executable: bool,
}

/// `fs_read` / `load_state` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsReadRequest {
    pub path: String,
}

/// `is_running` request payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsRunningRequest {
    pub handle: String,
}

/// `spawned` reply payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnedReply {
    pub id: u32,
    pub pid: i32,
    pub handle: String,
}

/// `stdout` / `stderr` event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputEvent {
    pub id: u32,
    pub data: String,
}

/// `exit` event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitEvent {
    pub id: u32,
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

/// `error` reply payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub id: u32,
    pub code: i32,
    pub message: String,
}

/// `ok` reply payload for `session_create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReply {
    pub uid: u32,
    pub gid: u32,
    pub username: String,
    pub home_dir: String,
}

/// `data` reply payload. `data` is base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataReply {
    pub data: String,
}

/// `running_status` reply payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningStatusReply {
    pub handle: String,
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
}
