//! Wire protocol between processors and the privileged services.
//!
//! The client writes one CBOR-encoded request and half-closes its side. The
//! server answers with newline-terminated lines:
//! - `OK:<payload>` ends a successful exchange
//! - `ERROR:<message>` lines report failure; the connection then closes
//! - lines starting with [`STATUS_INDENT`] are progress, relayed to the
//!   client's log
//!
//! Progress text can carry client-supplied paths, so it is always indented
//! and can never be mistaken for a result line.

use super::DaemonError;
use serde::Serialize;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

pub const OK_PREFIX: &str = "OK:";
pub const ERROR_PREFIX: &str = "ERROR:";
pub const STATUS_INDENT: &str = "  ";

/// Encode a request as CBOR.
pub fn encode_request<T: Serialize>(request: &T) -> Result<Vec<u8>, DaemonError> {
    let mut buf = Vec::new();
    ciborium::into_writer(request, &mut buf)
        .map_err(|e| DaemonError::Protocol(format!("cannot encode request: {}", e)))?;
    Ok(buf)
}

/// Read a whole request from `reader`, refusing more than `max_bytes`.
pub fn read_request(reader: impl Read, max_bytes: usize) -> Result<ciborium::Value, DaemonError> {
    let mut buf = Vec::new();
    reader
        .take(max_bytes as u64 + 1)
        .read_to_end(&mut buf)
        .map_err(|e| DaemonError::Protocol(format!("cannot read request: {}", e)))?;
    if buf.len() > max_bytes {
        return Err(DaemonError::Protocol(format!(
            "request exceeds {} bytes",
            max_bytes
        )));
    }
    if buf.is_empty() {
        return Err(DaemonError::Protocol("empty request".to_string()));
    }
    ciborium::from_reader(buf.as_slice())
        .map_err(|e| DaemonError::Protocol(format!("malformed request: {}", e)))
}

/// Server-side writer for response lines.
pub struct Responder<'a> {
    writer: &'a mut dyn Write,
}

impl<'a> Responder<'a> {
    pub fn new(writer: &'a mut dyn Write) -> Self {
        Self { writer }
    }

    /// Send progress, one indented line per line of `message`.
    pub fn status(&mut self, message: &str) {
        tracing::info!("{}", message);
        for line in message.split(['\n', '\r']).filter(|l| !l.is_empty()) {
            self.write_line(&format!("{}{}", STATUS_INDENT, line));
        }
    }

    pub fn ok(&mut self, payload: &str) {
        let payload = payload.replace(['\n', '\r'], " ");
        self.write_line(&format!("{}{}", OK_PREFIX, payload));
    }

    /// Send one `ERROR:` line per line of `message`.
    pub fn error(&mut self, message: &str) {
        tracing::error!("{}", message);
        for line in message.split(['\n', '\r']).filter(|l| !l.is_empty()) {
            self.write_line(&format!("{}{}", ERROR_PREFIX, line));
        }
    }

    fn write_line(&mut self, line: &str) {
        // The client may already be gone; nothing useful can be done then.
        if let Err(e) = writeln!(self.writer, "{}", line).and_then(|_| self.writer.flush()) {
            tracing::debug!("client write failed: {}", e);
        }
    }
}

/// Interpret a response stream. Returns the `OK:` payload.
pub fn read_response(reader: impl Read) -> Result<String, DaemonError> {
    let mut errors: Vec<String> = Vec::new();
    for line in BufReader::new(reader).lines() {
        let line = line.map_err(|e| DaemonError::Protocol(format!("read error: {}", e)))?;
        if let Some(progress) = line.strip_prefix(STATUS_INDENT) {
            tracing::info!("{}", progress.trim_start());
        } else if let Some(payload) = line.strip_prefix(OK_PREFIX) {
            if errors.is_empty() {
                return Ok(payload.to_string());
            }
            return Err(DaemonError::Protocol(format!(
                "result after error: {}",
                errors.join("\n")
            )));
        } else if let Some(message) = line.strip_prefix(ERROR_PREFIX) {
            errors.push(message.to_string());
        } else {
            tracing::warn!("unexpected response line: {}", line);
        }
    }
    if errors.is_empty() {
        Err(DaemonError::Protocol(
            "connection closed without a result".to_string(),
        ))
    } else {
        Err(DaemonError::Remote(errors.join("\n")))
    }
}

/// Send one request to the service at `socket` and wait for its answer.
pub fn send_request<T: Serialize>(
    socket: &Path,
    request: &T,
    timeout: Option<Duration>,
) -> Result<String, DaemonError> {
    let payload = encode_request(request)?;
    let mut stream = UnixStream::connect(socket).map_err(|e| {
        DaemonError::Protocol(format!("cannot connect to {}: {}", socket.display(), e))
    })?;
    stream
        .set_read_timeout(timeout)
        .map_err(|e| DaemonError::Protocol(e.to_string()))?;
    stream
        .write_all(&payload)
        .map_err(|e| DaemonError::Protocol(format!("cannot send request: {}", e)))?;
    stream
        .shutdown(Shutdown::Write)
        .map_err(|e| DaemonError::Protocol(format!("cannot finish request: {}", e)))?;
    read_response(stream)
}
