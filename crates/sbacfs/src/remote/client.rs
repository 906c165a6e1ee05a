//! Blocking client for remote policy decision points.
//!
//! The protocol is one plaintext exchange per TCP connection:
//!
//! ```text
//! client → server   /home/user/file.txt,open
//! server → client   /home/user/file.txt,open,True
//! ```
//!
//! The server echoes the request and appends `True` or `False`. The reply is
//! at most `len(path) + len(mode) + 8` bytes.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::request::Mode;

/// Connect and read timeout used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Address of one remote decision point.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or IP address
    #[serde(rename = "IP")]
    pub ip: String,
    /// TCP port
    #[serde(rename = "PORT")]
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint.
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Outcome of asking a remote authority.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The authority granted access
    Allow,
    /// The authority refused, or answered for a different request
    Deny(String),
    /// No usable answer was obtained; callers must treat this as a denial
    Indeterminate(String),
}

impl Verdict {
    /// Returns true only for [`Verdict::Allow`].
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

/// Why a remote exchange produced no answer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The endpoint could not be resolved or connected to
    #[error("cannot connect to {endpoint}: {source}")]
    Connect {
        /// The endpoint
        endpoint: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// Sending or receiving failed, including timeouts
    #[error("exchange with {endpoint} failed: {source}")]
    Io {
        /// The endpoint
        endpoint: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// The reply is longer than any valid reply for this request
    #[error("reply from {endpoint} exceeds {limit} bytes")]
    Oversized {
        /// The endpoint
        endpoint: String,
        /// Maximum reply length
        limit: usize,
    },
    /// The reply is not `path,mode,True|False`
    #[error("malformed reply from {endpoint}: {reply:?}")]
    Malformed {
        /// The endpoint
        endpoint: String,
        /// What was received
        reply: String,
    },
}

/// Something that can ask a remote authority about one request.
pub trait RemoteAuthorizer: Send + Sync + std::fmt::Debug {
    /// Ask `endpoint` whether `mode` on `path` is allowed.
    fn authorize(&self, path: &str, mode: Mode, endpoint: &Endpoint) -> Verdict;
}

/// [`RemoteAuthorizer`] speaking the plaintext TCP protocol.
///
/// One connection and exactly one attempt per request; there is no retry.
#[derive(Clone, Debug)]
pub struct TcpAuthorizer {
    timeout: Duration,
}

impl Default for TcpAuthorizer {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl TcpAuthorizer {
    /// Create a client with the given connect/read/write timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Perform one exchange and return the verdict it carries.
    pub fn exchange(
        &self,
        path: &str,
        mode: Mode,
        endpoint: &Endpoint,
    ) -> Result<Verdict, TransportError> {
        let name = endpoint.to_string();
        let mode = mode.as_str();
        let limit = path.len() + mode.len() + 8;

        let mut stream = self.connect(endpoint)?;
        let io_err = |source| TransportError::Io {
            endpoint: name.clone(),
            source,
        };

        stream
            .set_read_timeout(Some(self.timeout))
            .and_then(|()| stream.set_write_timeout(Some(self.timeout)))
            .map_err(io_err)?;

        tracing::debug!(endpoint = %name, path, mode, "sending authorization request");
        stream
            .write_all(format!("{path},{mode}").as_bytes())
            .map_err(io_err)?;

        let deadline = Instant::now() + self.timeout;
        let reply = read_reply(&mut stream, limit, deadline).map_err(io_err)?;
        if reply.len() > limit {
            return Err(TransportError::Oversized {
                endpoint: name,
                limit,
            });
        }

        let reply = String::from_utf8_lossy(&reply).into_owned();
        tracing::debug!(endpoint = %name, %reply, "received authorization reply");
        parse_reply(&reply, path, mode).ok_or(TransportError::Malformed {
            endpoint: name,
            reply,
        })
    }

    fn connect(&self, endpoint: &Endpoint) -> Result<TcpStream, TransportError> {
        let connect_err = |source| TransportError::Connect {
            endpoint: endpoint.to_string(),
            source,
        };
        let addrs: Vec<SocketAddr> = (endpoint.ip.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(connect_err)?
            .collect();

        let mut last_err = std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            "no addresses resolved",
        );
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = e,
            }
        }
        Err(connect_err(last_err))
    }
}

impl RemoteAuthorizer for TcpAuthorizer {
    fn authorize(&self, path: &str, mode: Mode, endpoint: &Endpoint) -> Verdict {
        match self.exchange(path, mode, endpoint) {
            Ok(verdict) => {
                tracing::info!(%endpoint, path, %mode, ?verdict, "remote authority answered");
                verdict
            }
            Err(e) => {
                tracing::error!(error = %e, "remote authorization failed");
                Verdict::Indeterminate(e.to_string())
            }
        }
    }
}

/// Read until a complete reply arrives, the peer closes, or more than
/// `limit` bytes have been received. The whole reply must arrive before
/// `deadline`, however it is split into segments.
fn read_reply(
    stream: &mut TcpStream,
    limit: usize,
    deadline: Instant,
) -> std::io::Result<Vec<u8>> {
    let mut reply = Vec::with_capacity(limit + 1);
    let mut buf = vec![0u8; limit + 1];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "reply not complete before the deadline",
            ));
        }
        stream.set_read_timeout(Some(remaining))?;

        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        reply.extend_from_slice(&buf[..n]);
        if reply.len() > limit || reply.ends_with(b"True") || reply.ends_with(b"False") {
            break;
        }
    }
    Ok(reply)
}

/// Parse `path,mode,True|False`. The split is done from the right so that
/// paths containing commas survive.
fn parse_reply(reply: &str, path: &str, mode: &str) -> Option<Verdict> {
    let mut parts = reply.rsplitn(3, ',');
    let allowed = parts.next()?;
    let rmode = parts.next()?;
    let rpath = parts.next()?;

    let allowed = match allowed {
        "True" => true,
        "False" => false,
        _ => return None,
    };

    if rpath != path || rmode != mode {
        return Some(Verdict::Deny(format!(
            "authority answered for '{rpath},{rmode}' instead of '{path},{mode}'"
        )));
    }
    Some(if allowed {
        Verdict::Allow
    } else {
        Verdict::Deny("remote authority refused access".to_string())
    })
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    /// Accept one connection, read the request, and answer with `reply`
    /// built from it.
    fn one_shot_server(reply: impl Fn(&str) -> String + Send + 'static) -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let n = conn.read(&mut buf).unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).into_owned();
            let _ = conn.write_all(reply(&request).as_bytes());
        });
        Endpoint::new("127.0.0.1", port)
    }

    #[test]
    fn test_parse_reply() {
        assert_eq!(parse_reply("/a,open,True", "/a", "open"), Some(Verdict::Allow));
        assert!(matches!(
            parse_reply("/a,open,False", "/a", "open"),
            Some(Verdict::Deny(_))
        ));
        assert!(matches!(
            parse_reply("/b,open,True", "/a", "open"),
            Some(Verdict::Deny(_))
        ));
        assert!(matches!(
            parse_reply("/a,read,True", "/a", "open"),
            Some(Verdict::Deny(_))
        ));
        assert_eq!(
            parse_reply("/a,b,open,True", "/a,b", "open"),
            Some(Verdict::Allow)
        );
        assert_eq!(parse_reply("/a,open,yes", "/a", "open"), None);
        assert_eq!(parse_reply("garbage", "/a", "open"), None);
    }

    #[test]
    fn test_allow_round_trip() {
        let endpoint = one_shot_server(|req| format!("{req},True"));
        let verdict = TcpAuthorizer::default().authorize("/foo/a", Mode::Read, &endpoint);
        assert!(verdict.is_allowed());
    }

    #[test]
    fn test_deny_round_trip() {
        let endpoint = one_shot_server(|req| format!("{req},False"));
        let verdict = TcpAuthorizer::default().authorize("/foo/a", Mode::Open, &endpoint);
        assert!(matches!(verdict, Verdict::Deny(_)));
        assert!(!verdict.is_allowed());
    }

    #[test]
    fn test_echo_mismatch_denies() {
        let endpoint = one_shot_server(|_| "/other,open,True".to_string());
        let verdict = TcpAuthorizer::default().authorize("/mine", Mode::Open, &endpoint);
        assert!(matches!(verdict, Verdict::Deny(_)));
    }

    #[test]
    fn test_oversized_reply_is_indeterminate() {
        let endpoint = one_shot_server(|req| format!("{req}{},True", "x".repeat(64)));
        let verdict = TcpAuthorizer::default().authorize("/a", Mode::Open, &endpoint);
        assert!(matches!(verdict, Verdict::Indeterminate(_)));
    }

    #[test]
    fn test_unreachable_is_indeterminate() {
        // Bind then drop to get a port nobody listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let endpoint = Endpoint::new("127.0.0.1", port);
        let verdict = TcpAuthorizer::new(Duration::from_millis(500)).authorize(
            "/a",
            Mode::Open,
            &endpoint,
        );
        assert!(matches!(verdict, Verdict::Indeterminate(_)));
    }

    #[test]
    fn test_trickling_reply_is_bounded_by_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let _ = conn.read(&mut buf).unwrap();
            // One byte at a time, each well within the per-read timeout.
            for _ in 0..14 {
                if conn.write_all(b"x").is_err() {
                    break;
                }
                thread::sleep(Duration::from_millis(150));
            }
        });

        let started = std::time::Instant::now();
        let verdict = TcpAuthorizer::new(Duration::from_millis(200)).authorize(
            "/a",
            Mode::Open,
            &Endpoint::new("127.0.0.1", port),
        );
        assert!(matches!(verdict, Verdict::Indeterminate(_)));
        assert!(
            started.elapsed() < Duration::from_millis(600),
            "took {:?}",
            started.elapsed()
        );
        handle.join().unwrap();
    }

    #[test]
    fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(600));
            drop(conn);
        });

        let started = std::time::Instant::now();
        let verdict = TcpAuthorizer::new(Duration::from_millis(200)).authorize(
            "/a",
            Mode::Open,
            &Endpoint::new("127.0.0.1", port),
        );
        assert!(matches!(verdict, Verdict::Indeterminate(_)));
        assert!(started.elapsed() < Duration::from_millis(550));
        handle.join().unwrap();
    }
}
