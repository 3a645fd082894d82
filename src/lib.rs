//! Zync Library
//!
//! Two-endpoint file tree synchronization over TCP: a server exposes its
//! working directory, a client walks both trees in lockstep and resolves
//! per-path differences.

pub mod cli;
pub mod client;
pub mod fs_enum;
pub mod logger;
pub mod protocol;
pub mod server;
pub mod transfer;
pub mod url;
pub mod wire;

/// Which side of a difference wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeepWhose {
    Mine,
    Theirs,
}

/// Process-wide options, built once at startup and read-only afterwards.
/// This decouples library code from the binary's Clap struct.
#[derive(Clone, Debug, Default)]
pub struct Options {
    pub port: u16,
    /// Reserved; accepted by the CLI but not consulted by the sync engine.
    pub hash: bool,
    pub verbose: bool,
    pub interactive: bool,
    /// Server: refuse deletion requests.
    pub restrict: bool,
    /// Server: refuse deletion requests and overwriting offers.
    pub restrict_all: bool,
    pub keep: Option<KeepWhose>,
    pub auto_delete: bool,
    /// Reserved; accepted by the CLI but not consulted by the sync engine.
    pub reverse: bool,
}

// Nagle off for the request/response chatter; keepalive is the only
// liveness mechanism the protocol relies on.
pub(crate) fn tune_socket(stream: &std::net::TcpStream) {
    let _ = stream.set_nodelay(true);
    #[cfg(unix)]
    {
        use std::os::fd::AsRawFd;
        let fd = stream.as_raw_fd();
        let keepalive: libc::c_int = 1;
        unsafe {
            let _ = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_KEEPALIVE,
                &keepalive as *const _ as *const libc::c_void,
                std::mem::size_of_val(&keepalive) as libc::socklen_t,
            );
        }
    }
}
