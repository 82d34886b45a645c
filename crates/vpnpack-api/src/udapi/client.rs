use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use socket2::{Domain, SockAddr, Socket, Type};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::Error;

pub const DEFAULT_SOCKET_PATH: &str = "/run/ubnt-udapi-server.sock";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const PROTOCOL_VERSION: &str = "v1.0";
/// Upper bound on a response frame. The largest real payload (`/firewall/sets`)
/// stays well under a megabyte.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

static BIND_SEQ: AtomicU64 = AtomicU64::new(0);

// ── Wire types ───────────────────────────────────────────────────────

/// HTTP-like verb carried in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

#[derive(Serialize)]
struct Envelope<'a> {
    id: String,
    version: &'static str,
    method: Method,
    entity: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request: Option<&'a Value>,
}

/// Decoded response frame. `response` is the raw embedded document.
#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub entity: String,
    #[serde(default)]
    pub response: Value,
}

impl Response {
    /// Decode the embedded `response` document into `T`.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_value(self.response.clone()).map_err(|e| Error::Deserialization {
            message: format!("{} {}: {e}", self.method, self.entity),
            body: self.response.to_string(),
        })
    }
}

// ── Client ───────────────────────────────────────────────────────────

/// One-shot request/response client for the udapi server.
///
/// Every request opens a fresh connection. There is no retry here;
/// callers decide what a failure means.
#[derive(Debug, Clone)]
pub struct UdapiClient {
    socket_path: PathBuf,
    bind_dir: PathBuf,
    timeout: Duration,
}

impl Default for UdapiClient {
    fn default() -> Self {
        Self::new(DEFAULT_SOCKET_PATH)
    }
}

impl UdapiClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            bind_dir: std::env::temp_dir(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the whole-request deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Directory used for the explicit client address when the server
    /// rejects unnamed peers.
    pub fn with_bind_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bind_dir = dir.into();
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Whether the server socket is present on this host.
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Send one request and wait for its response frame.
    pub async fn request(
        &self,
        method: Method,
        entity: &str,
        payload: Option<&Value>,
    ) -> Result<Response, Error> {
        match tokio::time::timeout(self.timeout, self.exchange(method, entity, payload)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                timeout_secs: self.timeout.as_secs(),
            }),
        }
    }

    pub async fn get(&self, entity: &str) -> Result<Response, Error> {
        self.request(Method::Get, entity, None).await
    }

    async fn exchange(
        &self,
        method: Method,
        entity: &str,
        payload: Option<&Value>,
    ) -> Result<Response, Error> {
        let (stream, _bind) = self.connect().await?;

        let envelope = Envelope {
            id: format!("manager-{}", Uuid::new_v4().simple()),
            version: PROTOCOL_VERSION,
            method,
            entity,
            request: payload,
        };
        let body = serde_json::to_vec(&envelope).map_err(|e| Error::BadResponse {
            message: format!("encode request: {e}"),
        })?;
        debug!(%method, entity, id = %envelope.id, "udapi request");

        let mut reader = BufReader::new(stream);
        let frame_head = format!("{}\n", body.len());
        reader.get_mut().write_all(frame_head.as_bytes()).await?;
        reader.get_mut().write_all(&body).await?;
        reader.get_mut().flush().await?;

        let mut size_line = String::new();
        reader.read_line(&mut size_line).await?;
        let size = parse_frame_len(&size_line)?;

        let mut buf = vec![0_u8; size];
        reader.read_exact(&mut buf).await?;
        trace!(entity, size, "udapi response frame");

        serde_json::from_slice(&buf).map_err(|e| Error::BadResponse {
            message: format!("decode envelope: {e}"),
        })
    }

    /// Direct dial first; on failure retry once from an explicit bound
    /// address, which the server requires when it filters anonymous peers.
    async fn connect(&self) -> Result<(UnixStream, Option<BindPath>), Error> {
        let direct_err = match UnixStream::connect(&self.socket_path).await {
            Ok(stream) => return Ok((stream, None)),
            Err(e) => e,
        };

        let bind = BindPath::next(&self.bind_dir);
        match connect_bound(&bind.0, &self.socket_path) {
            Ok(std_stream) => {
                std_stream.set_nonblocking(true)?;
                let stream = UnixStream::from_std(std_stream)?;
                debug!(bind = %bind.0.display(), "udapi connected via bind fallback");
                Ok((stream, Some(bind)))
            }
            Err(fallback_err) => {
                drop(bind);
                if direct_err.kind() == std::io::ErrorKind::ConnectionRefused
                    || fallback_err.kind() == std::io::ErrorKind::ConnectionRefused
                {
                    Err(Error::SocketRefused {
                        path: self.socket_path.clone(),
                    })
                } else {
                    Err(Error::SocketUnreachable {
                        path: self.socket_path.clone(),
                        source: direct_err,
                    })
                }
            }
        }
    }
}

fn parse_frame_len(line: &str) -> Result<usize, Error> {
    match line.trim().parse::<usize>() {
        Ok(n) if n > 0 && n <= MAX_FRAME_LEN => Ok(n),
        _ => Err(Error::BadResponse {
            message: format!("invalid size {line:?}"),
        }),
    }
}

fn connect_bound(local: &Path, remote: &Path) -> std::io::Result<StdUnixStream> {
    let _ = std::fs::remove_file(local);
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.bind(&SockAddr::unix(local)?)?;
    socket.connect(&SockAddr::unix(remote)?)?;
    Ok(socket.into())
}

/// Client-side socket file for the bind fallback, unlinked on drop.
struct BindPath(PathBuf);

impl BindPath {
    fn next(dir: &Path) -> Self {
        let seq = BIND_SEQ.fetch_add(1, Ordering::Relaxed);
        Self(dir.join(format!(
            "vpn-pack-manager-udapi-{}-{seq}",
            std::process::id()
        )))
    }
}

impl Drop for BindPath {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn frame_len_rejects_zero_and_garbage() {
        assert_eq!(parse_frame_len("42\n").unwrap(), 42);
        assert!(matches!(parse_frame_len("0\n"), Err(Error::BadResponse { .. })));
        assert!(matches!(parse_frame_len("-3\n"), Err(Error::BadResponse { .. })));
        assert!(matches!(parse_frame_len("abc\n"), Err(Error::BadResponse { .. })));
        assert!(matches!(parse_frame_len(""), Err(Error::BadResponse { .. })));
        let oversize = format!("{}\n", MAX_FRAME_LEN + 1);
        assert!(parse_frame_len(&oversize).is_err());
    }

    #[test]
    fn envelope_omits_empty_request() {
        let env = Envelope {
            id: "manager-x".into(),
            version: PROTOCOL_VERSION,
            method: Method::Get,
            entity: "/firewall/sets",
            request: None,
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["method"], "GET");
        assert_eq!(json["version"], "v1.0");
        assert!(json.get("request").is_none());
    }

    #[test]
    fn bind_paths_are_unique_per_request() {
        let dir = std::env::temp_dir();
        let a = BindPath::next(&dir);
        let b = BindPath::next(&dir);
        assert_ne!(a.0, b.0);
    }
}
