//! L3: Listener Factory — binding sockets before privilege drop and
//! before any fork, so every worker inherits an already-bound, already
//! non-blocking socket (§4.1 steps 2-3).

use crate::error::BindError;
use crate::plan::ListenerCommon;
use nix::sys::socket::{self, AddressFamily, Backlog, SockFlag, SockType, SockaddrIn, SockaddrIn6};
use std::net::{SocketAddr, TcpListener as StdTcpListener, UdpSocket};
use std::os::fd::{FromRawFd, IntoRawFd};
use std::os::unix::io::AsRawFd;
use std::thread;
use std::time::Duration;

/// Bind a TCP listener, retrying on `EADDRINUSE`-class failures up to
/// `common.listen_retry` times, one second apart (§4.1 step 2). UDP gets
/// no retry: binding a UDP socket races far less often in practice and
/// the spec does not ask for one.
pub fn bind_tcp(common: &ListenerCommon) -> Result<StdTcpListener, BindError> {
    let attempts = common.listen_retry.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match bind_tcp_once(common) {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                last_err = Some(e);
                if attempt < attempts {
                    thread::sleep(Duration::from_secs(1));
                }
            }
        }
    }
    Err(BindError {
        address: common.bind_address.clone(),
        port: common.bind_port,
        attempts,
        os_error: last_err.map_or_else(|| "unknown".to_string(), |e| e.to_string()),
    })
}

/// `socket()`/`bind()`/`listen()` through `nix` so `common.backlog`
/// actually reaches the kernel, the way the teacher's own socket code
/// reaches `nix` rather than `std::net` whenever a `socket(2)` knob
/// `std::net` doesn't expose is needed.
fn bind_tcp_once(common: &ListenerCommon) -> std::io::Result<StdTcpListener> {
    let addr: SocketAddr = format!("{}:{}", common.bind_address, common.bind_port)
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{e}")))?;

    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    let fd = socket::socket(family, SockType::Stream, SockFlag::SOCK_NONBLOCK, None)
        .map_err(nix_to_io)?;
    socket::setsockopt(&fd, socket::sockopt::ReuseAddr, &true).map_err(nix_to_io)?;

    match addr {
        SocketAddr::V4(v4) => socket::bind(fd.as_raw_fd(), &SockaddrIn::from(v4)).map_err(nix_to_io)?,
        SocketAddr::V6(v6) => socket::bind(fd.as_raw_fd(), &SockaddrIn6::from(v6)).map_err(nix_to_io)?,
    }

    let backlog = Backlog::new(common.backlog.max(1)).map_err(nix_to_io)?;
    socket::listen(&fd, backlog).map_err(nix_to_io)?;

    // SAFETY: `fd` was just created by `socket()` above and is handed
    // off whole; nothing else still owns it once `into_raw_fd()` runs.
    let listener = unsafe { StdTcpListener::from_raw_fd(fd.into_raw_fd()) };
    Ok(listener)
}

pub fn bind_udp(common: &ListenerCommon) -> Result<UdpSocket, BindError> {
    let addr = format!("{}:{}", common.bind_address, common.bind_port);
    UdpSocket::bind(&addr)
        .map_err(|e| BindError {
            address: common.bind_address.clone(),
            port: common.bind_port,
            attempts: 1,
            os_error: e.to_string(),
        })
        .and_then(|sock| {
            sock.set_nonblocking(true).map_err(|e| BindError {
                address: common.bind_address.clone(),
                port: common.bind_port,
                attempts: 1,
                os_error: e.to_string(),
            })?;
            Ok(sock)
        })
}

fn nix_to_io(e: nix::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ListenerCommon;

    fn common(port: u16) -> ListenerCommon {
        ListenerCommon {
            name: "t".into(),
            bind_address: "127.0.0.1".into(),
            bind_port: port,
            worker_count: 1,
            backlog: 16,
            accept_timeout: None,
            listen_retry: 2,
            thread_pool_size: 4,
        }
    }

    #[test]
    fn binds_an_ephemeral_tcp_port() {
        let listener = bind_tcp(&common(0)).unwrap();
        assert!(listener.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn binds_an_ephemeral_udp_port() {
        let sock = bind_udp(&common(0)).unwrap();
        assert!(sock.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn retries_then_fails_on_persistent_conflict() {
        let first = bind_tcp(&common(0)).unwrap();
        let port = first.local_addr().unwrap().port();
        let err = bind_tcp(&common(port)).unwrap_err();
        assert_eq!(err.attempts, 2);
    }

    #[test]
    fn applies_the_configured_backlog_not_a_default() {
        // A backlog of 0 is clamped to 1 rather than rejected, mirroring
        // `listen(2)`'s own minimum-of-1 behavior.
        let mut c = common(0);
        c.backlog = 0;
        assert!(bind_tcp(&c).is_ok());
    }
}
