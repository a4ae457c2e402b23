//! Socket handlers: bind and connect

use super::{is_accepted_retval, Handler, HandlerContext, HandlerError, Registry};
use crate::proto::{SocketAddress, SocketMsg, SyscallMsg, SyscallPayload};
use crate::syscalls::{BIND, CONNECT};
use std::net::{Ipv4Addr, Ipv6Addr};

/// sizeof(struct sockaddr_storage)
const MAX_SOCKADDR_LEN: usize = 128;

pub(crate) fn register(registry: &mut Registry) {
    registry.insert(BIND, Handler::new(bind_entry));
    registry.insert(CONNECT, Handler::new(connect_entry).send_when(connect_should_send));
}

/// A non-blocking connect still in progress counts as an attempt worth reporting
fn connect_should_send(msg: &SyscallMsg) -> bool {
    is_accepted_retval(msg) || msg.retval == -(libc::EINPROGRESS as i64)
}

fn read_sockaddr(ctx: &HandlerContext<'_>) -> Result<SocketAddress, HandlerError> {
    let len = (ctx.arg(2) as usize).min(MAX_SOCKADDR_LEN);
    if len < 2 {
        return Err(HandlerError::Malformed("sockaddr"));
    }
    decode_sockaddr(&ctx.read_bytes(ctx.arg(1), len)?)
}

fn bind_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let addr = read_sockaddr(ctx)?;
    msg.payload = SyscallPayload::Bind(SocketMsg { addr });
    Ok(())
}

fn connect_entry(ctx: &HandlerContext<'_>, msg: &mut SyscallMsg) -> Result<(), HandlerError> {
    let addr = read_sockaddr(ctx)?;
    msg.payload = SyscallPayload::Connect(SocketMsg { addr });
    Ok(())
}

fn slice<const N: usize>(raw: &[u8], offset: usize) -> Result<[u8; N], HandlerError> {
    raw.get(offset..offset + N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(HandlerError::Malformed("sockaddr"))
}

/// Decode a raw `sockaddr` (family in native order, port in network order)
pub fn decode_sockaddr(raw: &[u8]) -> Result<SocketAddress, HandlerError> {
    let family = u16::from_ne_bytes(slice(raw, 0)?);
    match family as i32 {
        libc::AF_INET => Ok(SocketAddress {
            family,
            port: u16::from_be_bytes(slice(raw, 2)?),
            ip: Some(Ipv4Addr::from(slice::<4>(raw, 4)?).to_string()),
            path: None,
        }),
        libc::AF_INET6 => Ok(SocketAddress {
            family,
            port: u16::from_be_bytes(slice(raw, 2)?),
            ip: Some(Ipv6Addr::from(slice::<16>(raw, 8)?).to_string()),
            path: None,
        }),
        libc::AF_UNIX => {
            let sun_path = &raw[2..];
            let path = match sun_path.first() {
                // abstract namespace: length-delimited, may contain NULs
                Some(0) => format!("@{}", String::from_utf8_lossy(&sun_path[1..])),
                _ => {
                    let end = sun_path.iter().position(|&b| b == 0).unwrap_or(sun_path.len());
                    String::from_utf8_lossy(&sun_path[..end]).into_owned()
                }
            };
            Ok(SocketAddress {
                family,
                ip: None,
                port: 0,
                path: Some(path),
            })
        }
        _ => Err(HandlerError::UnsupportedFamily(family)),
    }
}
