//! Peer identity for daemon connections.
//!
//! The services trust only what the kernel reports about the connecting
//! process: `SO_PEERCRED` on Linux, `getpeereid` on the BSDs and macOS.

use super::DaemonError;
use std::os::unix::net::UnixStream;

/// Identity of the process on the other end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
    /// Not available from `getpeereid`.
    pub pid: Option<i32>,
}

impl PeerCredentials {
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Establishes who is connected.
pub trait Authenticator {
    fn authenticate(&self, stream: &UnixStream) -> Result<PeerCredentials, DaemonError>;
}

/// Reads peer credentials from the socket.
#[derive(Debug, Default, Clone, Copy)]
pub struct PeerCredAuthenticator;

impl Authenticator for PeerCredAuthenticator {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn authenticate(&self, stream: &UnixStream) -> Result<PeerCredentials, DaemonError> {
        use nix::sys::socket::{getsockopt, sockopt};
        let cred = getsockopt(stream, sockopt::PeerCredentials)
            .map_err(|e| DaemonError::Protocol(format!("cannot read peer credentials: {}", e)))?;
        Ok(PeerCredentials {
            uid: cred.uid(),
            gid: cred.gid(),
            pid: Some(cred.pid()),
        })
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn authenticate(&self, stream: &UnixStream) -> Result<PeerCredentials, DaemonError> {
        let (uid, gid) = nix::unistd::getpeereid(stream)
            .map_err(|e| DaemonError::Protocol(format!("cannot read peer credentials: {}", e)))?;
        Ok(PeerCredentials {
            uid: uid.as_raw(),
            gid: gid.as_raw(),
            pid: None,
        })
    }
}
