//! Wire protocol between the tracer and the remote collector
//!
//! Every message is MessagePack-encoded (named/map form, so fields can be added
//! without breaking older collectors) and framed with a 4-byte length prefix in
//! native byte order:
//!
//! ```text
//! ┌──────────────┬────────────────────────────┐
//! │ len: u32 (ne)│ payload: [u8; len] msgpack │
//! └──────────────┴────────────────────────────┘
//! ```
//!
//! Two shapes travel on the wire: a `Hello` handshake, sent once per
//! connection, and `Syscall` events.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};
use thiserror::Error;

/// Size of the frame length prefix
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest payload `read_frame` accepts
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors raised while encoding or decoding wire messages
#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("unable to marshal message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("unable to unmarshal message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("frame of {0} bytes exceeds the 4-byte length prefix")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// How the traced tree was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Attached to already-running pids
    Attached,
    /// Launched and wrapped by the tracer
    Wrapped,
}

/// Container the tracer runs in, derived once at start
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerContext {
    /// Container id from the cgroup path (empty outside a container)
    pub id: String,
    /// Creation time of the container's init process, ns since epoch
    pub created_at: u64,
}

/// Session-opening handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloMsg {
    pub mode: Mode,
    /// Inode of the tracer's pid namespace
    pub ns_id: u64,
    pub container_context: ContainerContext,
    /// argv of the wrapped entrypoint (empty when attached)
    pub entrypoint_args: Vec<String>,
}

/// Application-level span context learned through span TLS registration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanContext {
    pub span_id: u64,
    pub trace_id_lo: u64,
    pub trace_id_hi: u64,
}

impl fmt::Display for SpanContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut trace_id = [0u8; 16];
        trace_id[..8].copy_from_slice(&self.trace_id_hi.to_be_bytes());
        trace_id[8..].copy_from_slice(&self.trace_id_lo.to_be_bytes());
        write!(
            f,
            "{}-{}",
            hex::encode(trace_id),
            hex::encode(self.span_id.to_be_bytes())
        )
    }
}

/// Process credentials, with names when stats collection is enabled
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub uid: u32,
    pub euid: u32,
    pub gid: u32,
    pub egid: u32,
    pub user: Option<String>,
    pub euser: Option<String>,
    pub group: Option<String>,
    pub egroup: Option<String>,
}

/// File metadata captured from the tracer side
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStats {
    pub mode: u32,
    pub inode: u64,
    pub uid: u32,
    pub gid: u32,
    pub user: Option<String>,
    pub group: Option<String>,
    /// Modification time, ns since epoch
    pub mtime: u64,
    /// Status change time, ns since epoch
    pub ctime: u64,
}

/// A path as seen by the tracee, resolved against its cwd or dirfd
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub stats: Option<FileStats>,
}

impl FileInfo {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            stats: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenMsg {
    pub file: FileInfo,
    pub flags: u32,
    pub mode: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecMsg {
    pub file: FileInfo,
    pub args: Vec<String>,
    pub args_truncated: bool,
    pub envs: Vec<String>,
    pub envs_truncated: bool,
    /// Stamped for the originally traced pids and for procfs snapshots
    pub credentials: Option<Credentials>,
    /// Known only for procfs snapshots
    pub ppid: Option<u32>,
    /// Synthesized by the proc scanner rather than observed
    pub from_procfs: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkMsg {
    pub ppid: u32,
}

/// Why a process went away
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitCause {
    #[default]
    Exited,
    CoreDumped,
    Signaled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitMsg {
    pub cause: ExitCause,
    /// Exit code, or the signal number for signaled/core-dumped exits
    pub code: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChdirMsg {
    pub dir: FileInfo,
}

/// setuid family; `None` means "left unchanged" (-1 in the syscall)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetUidMsg {
    pub uid: Option<u32>,
    pub euid: Option<u32>,
    pub fsuid: Option<u32>,
    pub user: Option<String>,
    pub euser: Option<String>,
    pub fsuser: Option<String>,
}

/// setgid family; `None` means "left unchanged" (-1 in the syscall)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetGidMsg {
    pub gid: Option<u32>,
    pub egid: Option<u32>,
    pub fsgid: Option<u32>,
    pub group: Option<String>,
    pub egroup: Option<String>,
    pub fsgroup: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsetMsg {
    pub effective: u64,
    pub permitted: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlinkMsg {
    pub file: FileInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RmdirMsg {
    pub dir: FileInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameMsg {
    pub old: FileInfo,
    pub new: FileInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MkdirMsg {
    pub dir: FileInfo,
    pub mode: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkMsg {
    pub target: FileInfo,
    pub link: FileInfo,
    pub symbolic: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChmodMsg {
    pub file: FileInfo,
    pub mode: u32,
}

/// chown family; -1 means "left unchanged"
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChownMsg {
    pub file: FileInfo,
    pub uid: i64,
    pub gid: i64,
    pub user: Option<String>,
    pub group: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtimesMsg {
    pub file: FileInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadModuleMsg {
    /// Backing file for `finit_module`
    pub file: Option<FileInfo>,
    pub name: String,
    pub args: String,
    pub loaded_from_memory: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnloadModuleMsg {
    pub name: String,
}

/// Decoded `sockaddr`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketAddress {
    pub family: u16,
    /// IPv4/IPv6 textual address
    pub ip: Option<String>,
    pub port: u16,
    /// Unix socket path, `@`-prefixed for the abstract namespace
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketMsg {
    pub addr: SocketAddress,
}

/// Syscall-class specific payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum SyscallPayload {
    /// No entry handler populated the payload; never transmitted
    #[default]
    Unknown,
    Open(OpenMsg),
    Exec(ExecMsg),
    Fork(ForkMsg),
    Exit(ExitMsg),
    Chdir(ChdirMsg),
    SetUid(SetUidMsg),
    SetGid(SetGidMsg),
    Capset(CapsetMsg),
    Unlink(UnlinkMsg),
    Rmdir(RmdirMsg),
    Rename(RenameMsg),
    Mkdir(MkdirMsg),
    Link(LinkMsg),
    Chmod(ChmodMsg),
    Chown(ChownMsg),
    Utimes(UtimesMsg),
    LoadModule(LoadModuleMsg),
    UnloadModule(UnloadModuleMsg),
    Bind(SocketMsg),
    Connect(SocketMsg),
}

impl SyscallPayload {
    pub fn is_known(&self) -> bool {
        !matches!(self, SyscallPayload::Unknown)
    }

    /// Short tag used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            SyscallPayload::Unknown => "unknown",
            SyscallPayload::Open(_) => "open",
            SyscallPayload::Exec(_) => "exec",
            SyscallPayload::Fork(_) => "fork",
            SyscallPayload::Exit(_) => "exit",
            SyscallPayload::Chdir(_) => "chdir",
            SyscallPayload::SetUid(_) => "setuid",
            SyscallPayload::SetGid(_) => "setgid",
            SyscallPayload::Capset(_) => "capset",
            SyscallPayload::Unlink(_) => "unlink",
            SyscallPayload::Rmdir(_) => "rmdir",
            SyscallPayload::Rename(_) => "rename",
            SyscallPayload::Mkdir(_) => "mkdir",
            SyscallPayload::Link(_) => "link",
            SyscallPayload::Chmod(_) => "chmod",
            SyscallPayload::Chown(_) => "chown",
            SyscallPayload::Utimes(_) => "utimes",
            SyscallPayload::LoadModule(_) => "load_module",
            SyscallPayload::UnloadModule(_) => "unload_module",
            SyscallPayload::Bind(_) => "bind",
            SyscallPayload::Connect(_) => "connect",
        }
    }
}

/// A syscall event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallMsg {
    /// Owning process (tgid)
    pub pid: u32,
    /// ns since epoch
    pub timestamp: u64,
    pub container_id: String,
    pub span_context: Option<SpanContext>,
    pub retval: i64,
    pub payload: SyscallPayload,
}

/// Top-level message sent to the collector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum Message {
    Hello(HelloMsg),
    Syscall(SyscallMsg),
}

impl Message {
    /// Encode to MessagePack (map form)
    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decode a MessagePack payload (without its length prefix)
    pub fn decode(payload: &[u8]) -> Result<Self, ProtoError> {
        Ok(rmp_serde::from_slice(payload)?)
    }

    /// Encode and prepend the length prefix
    pub fn to_frame(&self) -> Result<Vec<u8>, ProtoError> {
        frame(&self.encode()?)
    }
}

/// Prepend the 4-byte native-endian length prefix to an encoded payload
pub fn frame(payload: &[u8]) -> Result<Vec<u8>, ProtoError> {
    let len = u32::try_from(payload.len()).map_err(|_| ProtoError::FrameTooLarge(payload.len()))?;
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&len.to_ne_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Write one framed payload as a single buffer, so a failed write never
/// leaves a dangling length prefix queued behind it
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), ProtoError> {
    writer.write_all(&frame(payload)?)?;
    writer.flush()?;
    Ok(())
}

/// Read one framed payload; the read side of `write_frame`
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header)?;
    let len = u32::from_ne_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds {}", len, MAX_FRAME_LEN),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn hello() -> Message {
        Message::Hello(HelloMsg {
            mode: Mode::Wrapped,
            ns_id: 4026531836,
            container_context: ContainerContext {
                id: "a".repeat(64),
                created_at: 1_700_000_000_000_000_000,
            },
            entrypoint_args: vec!["/bin/sh".to_string(), "-c".to_string(), "true".to_string()],
        })
    }

    fn syscall(payload: SyscallPayload) -> Message {
        Message::Syscall(SyscallMsg {
            pid: 42,
            timestamp: 1234,
            container_id: "abc".to_string(),
            span_context: Some(SpanContext {
                span_id: 7,
                trace_id_lo: 8,
                trace_id_hi: 9,
            }),
            retval: -13,
            payload,
        })
    }

    fn every_shape() -> Vec<Message> {
        let file = FileInfo {
            path: "/etc/secret".to_string(),
            stats: Some(FileStats {
                mode: 0o100600,
                inode: 99,
                uid: 0,
                gid: 0,
                user: Some("root".to_string()),
                group: None,
                mtime: 1,
                ctime: 2,
            }),
        };
        vec![
            hello(),
            syscall(SyscallPayload::Open(OpenMsg {
                file: file.clone(),
                flags: 0,
                mode: 0o644,
            })),
            syscall(SyscallPayload::Exec(ExecMsg {
                file: file.clone(),
                args: vec!["ls".to_string(), "-l".to_string()],
                args_truncated: false,
                envs: vec!["PATH=/bin".to_string()],
                envs_truncated: true,
                credentials: Some(Credentials {
                    uid: 1000,
                    euid: 1000,
                    gid: 1000,
                    egid: 1000,
                    user: Some("alice".to_string()),
                    ..Default::default()
                }),
                ppid: Some(1),
                from_procfs: true,
            })),
            syscall(SyscallPayload::Fork(ForkMsg { ppid: 1 })),
            syscall(SyscallPayload::Exit(ExitMsg {
                cause: ExitCause::Signaled,
                code: 9,
            })),
            syscall(SyscallPayload::SetUid(SetUidMsg {
                uid: Some(0),
                euid: None,
                ..Default::default()
            })),
            syscall(SyscallPayload::Rename(RenameMsg {
                old: FileInfo::new("/tmp/a"),
                new: file,
            })),
            syscall(SyscallPayload::Chown(ChownMsg {
                file: FileInfo::new("/tmp/a"),
                uid: -1,
                gid: 5,
                user: None,
                group: Some("tty".to_string()),
            })),
            syscall(SyscallPayload::Connect(SocketMsg {
                addr: SocketAddress {
                    family: 2,
                    ip: Some("10.0.0.1".to_string()),
                    port: 443,
                    path: None,
                },
            })),
            syscall(SyscallPayload::LoadModule(LoadModuleMsg {
                file: None,
                name: String::new(),
                args: "debug=1".to_string(),
                loaded_from_memory: true,
            })),
            syscall(SyscallPayload::Chdir(ChdirMsg {
                dir: FileInfo::new("/var/tmp"),
            })),
            syscall(SyscallPayload::SetGid(SetGidMsg {
                gid: Some(5),
                egid: Some(5),
                fsgid: None,
                group: Some("tty".to_string()),
                egroup: Some("tty".to_string()),
                fsgroup: None,
            })),
            syscall(SyscallPayload::Capset(CapsetMsg {
                effective: 1 << 21,
                permitted: u64::MAX,
            })),
            syscall(SyscallPayload::Unlink(UnlinkMsg {
                file: FileInfo::new("/tmp/gone"),
            })),
            syscall(SyscallPayload::Rmdir(RmdirMsg {
                dir: FileInfo::new("/tmp/dir"),
            })),
            syscall(SyscallPayload::Mkdir(MkdirMsg {
                dir: FileInfo::new("/tmp/dir"),
                mode: 0o755,
            })),
            syscall(SyscallPayload::Link(LinkMsg {
                target: FileInfo::new("/etc/passwd"),
                link: FileInfo::new("/tmp/pw"),
                symbolic: true,
            })),
            syscall(SyscallPayload::Chmod(ChmodMsg {
                file: FileInfo::new("/tmp/run.sh"),
                mode: 0o4755,
            })),
            syscall(SyscallPayload::Utimes(UtimesMsg {
                file: FileInfo::new("/var/log/auth.log"),
            })),
            syscall(SyscallPayload::UnloadModule(UnloadModuleMsg {
                name: "nf_tables".to_string(),
            })),
            syscall(SyscallPayload::Bind(SocketMsg {
                addr: SocketAddress {
                    family: 1,
                    ip: None,
                    port: 0,
                    path: Some("@agent.sock".to_string()),
                },
            })),
        ]
    }

    #[test]
    fn test_shapes_cover_every_payload_kind() {
        let kinds: std::collections::BTreeSet<&str> = every_shape()
            .iter()
            .filter_map(|msg| match msg {
                Message::Syscall(m) => Some(m.payload.kind()),
                Message::Hello(_) => None,
            })
            .collect();
        assert_eq!(kinds.len(), 20);
        assert!(!kinds.contains("unknown"));
    }

    #[test]
    fn test_frame_round_trip_every_shape() {
        for msg in every_shape() {
            let frame = msg.to_frame().unwrap();
            let payload = read_frame(&mut Cursor::new(frame)).unwrap();
            assert_eq!(Message::decode(&payload).unwrap(), msg);
        }
    }

    #[test]
    fn test_frame_prefix_is_native_endian_length() {
        let frame = frame(b"abcde").unwrap();
        assert_eq!(&frame[..4], &5u32.to_ne_bytes());
        assert_eq!(&frame[4..], b"abcde");
    }

    #[test]
    fn test_consecutive_frames_on_one_stream() {
        let mut wire = Vec::new();
        for msg in every_shape() {
            write_frame(&mut wire, &msg.encode().unwrap()).unwrap();
        }
        let mut cursor = Cursor::new(wire);
        for msg in every_shape() {
            let payload = read_frame(&mut cursor).unwrap();
            assert_eq!(Message::decode(&payload).unwrap(), msg);
        }
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn test_truncated_frame_is_an_error() {
        let mut frame = hello().to_frame().unwrap();
        frame.truncate(frame.len() - 1);
        let err = read_frame(&mut Cursor::new(frame)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut stream = ((MAX_FRAME_LEN + 1) as u32).to_ne_bytes().to_vec();
        stream.extend_from_slice(&[0u8; 8]);
        let err = read_frame(&mut io::Cursor::new(stream)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(Message::decode(&[0xc1, 0x00, 0xff]).is_err());
    }

    #[test]
    fn test_payload_kind_and_known() {
        assert!(!SyscallPayload::Unknown.is_known());
        assert!(SyscallPayload::Fork(ForkMsg { ppid: 1 }).is_known());
        assert_eq!(SyscallPayload::Exit(ExitMsg::default()).kind(), "exit");
    }

    #[test]
    fn test_span_context_display() {
        let span = SpanContext {
            span_id: 0xb7ad6b7169203331,
            trace_id_lo: 0x8448eb211c80319c,
            trace_id_hi: 0x0af7651916cd43dd,
        };
        assert_eq!(
            span.to_string(),
            "0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331"
        );
    }
}
