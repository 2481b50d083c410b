//! Privileged packaging and installation services.
//!
//! Each service listens on its own Unix socket, handles one connection at a
//! time in accept order, and exits after an idle period.

pub mod auth;
pub mod fsops;
pub mod installer;
pub mod packager;
pub mod protocol;
pub mod validate;

use auth::{Authenticator, PeerCredentials};
use protocol::Responder;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_PACKAGER_SOCKET: &str = "/var/run/pkgsmith/packager.sock";
pub const DEFAULT_INSTALLER_SOCKET: &str = "/var/run/pkgsmith/installer.sock";
pub const DEFAULT_WORK_DIR: &str = "/var/tmp/pkgsmith";
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024;
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors reported to clients as `ERROR:` lines.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The request was rejected before anything was changed.
    #[error("{0}")]
    Validation(String),
    /// A privileged filesystem or packaging operation failed.
    #[error("{0}")]
    Privileged(String),
    /// Transport or encoding failure.
    #[error("{0}")]
    Protocol(String),
    /// `ERROR:` lines received from a service.
    #[error("{0}")]
    Remote(String),
}

/// A service's request logic.
pub trait RequestHandler {
    fn service(&self) -> &str;

    /// Handle one decoded request. The returned string is the `OK:` payload.
    fn handle(
        &self,
        request: &ciborium::Value,
        peer: &PeerCredentials,
        out: &mut Responder,
    ) -> Result<String, DaemonError>;
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    pub socket_mode: u32,
    /// `None` serves until killed.
    pub idle_timeout: Option<Duration>,
    pub read_timeout: Duration,
    pub max_request_bytes: usize,
}

impl ServerConfig {
    pub fn new(socket_path: &Path) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
            socket_mode: 0o666,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            read_timeout: READ_TIMEOUT,
            max_request_bytes: MAX_REQUEST_BYTES,
        }
    }
}

/// A bound service socket.
pub struct Server<H: RequestHandler, A: Authenticator> {
    config: ServerConfig,
    handler: H,
    authenticator: A,
    listener: UnixListener,
    timed_out: bool,
}

impl<H: RequestHandler, A: Authenticator> Server<H, A> {
    /// Bind the socket, replacing a stale socket file.
    pub fn bind(config: ServerConfig, handler: H, authenticator: A) -> Result<Self, DaemonError> {
        let path = &config.socket_path;
        if let Ok(meta) = fs::symlink_metadata(path) {
            if !meta.file_type().is_socket() {
                return Err(DaemonError::Privileged(format!(
                    "{} exists and is not a socket",
                    path.display()
                )));
            }
            fs::remove_file(path).map_err(|e| {
                DaemonError::Privileged(format!("cannot remove {}: {}", path.display(), e))
            })?;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                DaemonError::Privileged(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let listener = UnixListener::bind(path)
            .map_err(|e| DaemonError::Protocol(format!("cannot bind {}: {}", path.display(), e)))?;
        fs::set_permissions(path, fs::Permissions::from_mode(config.socket_mode)).map_err(|e| {
            DaemonError::Privileged(format!("cannot chmod {}: {}", path.display(), e))
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|e| DaemonError::Protocol(e.to_string()))?;
        tracing::info!(
            "{} listening on {} (mode {:o})",
            handler.service(),
            path.display(),
            config.socket_mode
        );
        Ok(Self {
            config,
            handler,
            authenticator,
            listener,
            timed_out: false,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// True once `serve` returned because of the idle timeout.
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Accept and handle connections until the idle timeout expires.
    pub fn serve(&mut self) -> Result<(), DaemonError> {
        let mut last_activity = Instant::now();
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = stream.set_nonblocking(false) {
                        tracing::warn!("cannot configure connection: {}", e);
                        continue;
                    }
                    // Failures were already reported to the client.
                    let _ = self.handle_connection(stream);
                    last_activity = Instant::now();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if let Some(limit) = self.config.idle_timeout {
                        if last_activity.elapsed() >= limit {
                            tracing::info!("{} idle for {:?}, exiting", self.handler.service(), limit);
                            self.timed_out = true;
                            return Ok(());
                        }
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(DaemonError::Protocol(format!("accept failed: {}", e)));
                }
            }
        }
    }

    /// Run one exchange: authenticate, read, handle, answer.
    pub fn handle_connection(&self, stream: UnixStream) -> Result<String, DaemonError> {
        let mut writer = &stream;
        let mut out = Responder::new(&mut writer);
        let result = self.exchange(&stream, &mut out);
        match result {
            Ok(ref payload) => out.ok(payload),
            Err(ref e) => out.error(&e.to_string()),
        }
        result
    }

    fn exchange(&self, stream: &UnixStream, out: &mut Responder) -> Result<String, DaemonError> {
        stream
            .set_read_timeout(Some(self.config.read_timeout))
            .map_err(|e| DaemonError::Protocol(e.to_string()))?;
        let peer = self.authenticator.authenticate(stream)?;
        tracing::info!(
            "{} request from uid {} (pid {:?})",
            self.handler.service(),
            peer.uid,
            peer.pid
        );
        let request = protocol::read_request(stream, self.config.max_request_bytes)?;
        self.handler.handle(&request, &peer, out)
    }
}

impl<H: RequestHandler, A: Authenticator> Drop for Server<H, A> {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.config.socket_path) {
            tracing::debug!("cannot remove {}: {}", self.config.socket_path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::fsops::current_ids;
    use indexmap::IndexMap;
    use std::io::{Read, Write};
    use std::net::Shutdown;

    struct FixedPeer(PeerCredentials);

    impl Authenticator for FixedPeer {
        fn authenticate(&self, _stream: &UnixStream) -> Result<PeerCredentials, DaemonError> {
            Ok(self.0)
        }
    }

    /// Echoes `name`; refuses peers other than root or the test user.
    struct Greeter;

    impl RequestHandler for Greeter {
        fn service(&self) -> &str {
            "greeter"
        }

        fn handle(
            &self,
            request: &ciborium::Value,
            peer: &PeerCredentials,
            out: &mut Responder,
        ) -> Result<String, DaemonError> {
            if peer.uid != current_ids().0 {
                return Err(DaemonError::Validation(format!("uid {} not allowed", peer.uid)));
            }
            let req: IndexMap<String, String> = request
                .deserialized()
                .map_err(|e| DaemonError::Validation(e.to_string()))?;
            out.status("greeting");
            Ok(format!("hello {}", req.get("name").cloned().unwrap_or_default()))
        }
    }

    fn me() -> PeerCredentials {
        let (uid, gid) = current_ids();
        PeerCredentials { uid, gid, pid: None }
    }

    fn config(dir: &Path) -> ServerConfig {
        let mut config = ServerConfig::new(&dir.join("run/greeter.sock"));
        config.idle_timeout = Some(Duration::from_millis(300));
        config
    }

    fn request(name: &str) -> Vec<u8> {
        let mut req = IndexMap::new();
        req.insert("name", name);
        protocol::encode_request(&req).unwrap()
    }

    fn exchange(server: &Server<Greeter, FixedPeer>, payload: &[u8]) -> String {
        let (mut client, server_side) = UnixStream::pair().unwrap();
        client.write_all(payload).unwrap();
        client.shutdown(Shutdown::Write).unwrap();
        let _ = server.handle_connection(server_side);
        let mut response = String::new();
        client.read_to_string(&mut response).unwrap();
        response
    }

    #[test]
    fn test_bind_sets_mode_and_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let first = Server::bind(cfg.clone(), Greeter, FixedPeer(me())).unwrap();
        std::mem::forget(first); // leave a stale socket behind
        let server = Server::bind(cfg.clone(), Greeter, FixedPeer(me())).unwrap();
        let mode = fs::metadata(server.socket_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o666);
        drop(server);
        assert!(!cfg.socket_path.exists());
    }

    #[test]
    fn test_bind_refuses_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        fs::create_dir_all(cfg.socket_path.parent().unwrap()).unwrap();
        fs::write(&cfg.socket_path, "not a socket").unwrap();
        assert!(Server::bind(cfg, Greeter, FixedPeer(me())).is_err());
    }

    #[test]
    fn test_connection_ok() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::bind(config(dir.path()), Greeter, FixedPeer(me())).unwrap();
        let response = exchange(&server, &request("world"));
        assert_eq!(response, "  greeting\nOK:hello world\n");
        assert_eq!(
            protocol::read_response(response.as_bytes()).unwrap(),
            "hello world"
        );
    }

    #[test]
    fn test_connection_rejected_peer() {
        let dir = tempfile::tempdir().unwrap();
        let stranger = PeerCredentials {
            uid: me().uid.wrapping_add(1),
            ..me()
        };
        let server = Server::bind(config(dir.path()), Greeter, FixedPeer(stranger)).unwrap();
        let response = exchange(&server, &request("world"));
        assert!(response.starts_with("ERROR:uid "));
        assert!(matches!(
            protocol::read_response(response.as_bytes()),
            Err(DaemonError::Remote(_))
        ));
    }

    #[test]
    fn test_connection_garbage_request() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::bind(config(dir.path()), Greeter, FixedPeer(me())).unwrap();
        let response = exchange(&server, &[0xff, 0xfe]);
        assert!(response.starts_with("ERROR:malformed request"));
    }

    #[test]
    fn test_serve_until_idle() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = Server::bind(config(dir.path()), Greeter, FixedPeer(me())).unwrap();
        let socket = server.socket_path().to_path_buf();
        let client = std::thread::spawn(move || {
            let mut req = IndexMap::new();
            req.insert("name", "socket");
            protocol::send_request(&socket, &req, Some(Duration::from_secs(5)))
        });
        server.serve().unwrap();
        assert!(server.timed_out());
        assert_eq!(client.join().unwrap().unwrap(), "hello socket");
    }
}
