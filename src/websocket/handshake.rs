//! HTTP Upgrade handshake.
//!
//! Reads the client's upgrade request from a freshly accepted socket,
//! answers with `101 Switching Protocols` and hands the socket back in
//! non-blocking mode, ready for framed I/O.

use std::io::{self, Read, Write};
use std::net::TcpStream;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::config::HandshakeConfig;
use crate::error::HandshakeError;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const KEY_HEADER: &str = "Sec-WebSocket-Key";

/// base64(SHA-1(key + GUID)).
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Find the `Sec-WebSocket-Key` value in a raw request.
///
/// Only lines terminated by `\r\n` count. Header names compare
/// case-insensitively.
pub fn extract_key(request: &str) -> Result<&str, HandshakeError> {
    let mut rest = request;
    while let Some(end) = rest.find("\r\n") {
        let line = &rest[..end];
        rest = &rest[end + 2..];

        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case(KEY_HEADER) {
                let value = value.trim();
                if !value.is_empty() {
                    return Ok(value);
                }
            }
        }
    }
    Err(HandshakeError::MissingKey)
}

pub fn upgrade_response(accept_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key
    )
}

fn bad_request_response(reason: &str) -> String {
    let body = format!("Bad Request: {}", reason);
    format!(
        "HTTP/1.1 400 Bad Request\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        body
    )
}

fn headers_complete(buf: &[u8]) -> bool {
    buf.windows(4).any(|w| w == b"\r\n\r\n")
}

fn is_retryable(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Read the upgrade request, stopping at the blank line or the byte budget.
///
/// Failed reads are retried at most `max_read_retries` times. If a read
/// stalls after some bytes have arrived, those bytes are taken as the
/// whole request.
fn read_request<R: Read>(stream: &mut R, config: &HandshakeConfig) -> Result<Vec<u8>, HandshakeError> {
    let mut buf = vec![0u8; config.read_budget];
    let mut filled = 0;
    let mut failures = 0;

    loop {
        if filled == buf.len() {
            return Err(HandshakeError::RequestTooLarge(config.read_budget));
        }

        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(HandshakeError::ConnectionClosed),
            Ok(n) => {
                filled += n;
                if headers_complete(&buf[..filled]) {
                    break;
                }
            }
            Err(e) if is_retryable(e.kind()) => {
                if filled > 0 {
                    break;
                }
                failures += 1;
                debug!("Handshake read attempt {} failed: {}", failures, e);
                if failures >= config.max_read_retries {
                    return Err(HandshakeError::RetriesExhausted(failures));
                }
            }
            Err(e) => return Err(HandshakeError::Read(e)),
        }
    }

    buf.truncate(filled);
    Ok(buf)
}

/// Run the upgrade exchange over any byte stream.
///
/// On a request without a key a `400 Bad Request` is written (best effort)
/// before the error is returned.
pub fn perform<S: Read + Write>(stream: &mut S, config: &HandshakeConfig) -> Result<(), HandshakeError> {
    let request = read_request(stream, config)?;
    let request = String::from_utf8_lossy(&request);

    let key = match extract_key(&request) {
        Ok(key) => key,
        Err(e) => {
            let _ = stream
                .write_all(bad_request_response(&e.to_string()).as_bytes())
                .and_then(|_| stream.flush());
            return Err(e);
        }
    };

    let response = upgrade_response(&compute_accept_key(key));
    stream
        .write_all(response.as_bytes())
        .and_then(|_| stream.flush())
        .map_err(HandshakeError::Write)
}

/// Handshake a just-accepted socket.
///
/// The exchange runs in blocking mode with a per-read timeout; on success
/// the socket is switched to non-blocking and returned.
pub fn accept(mut stream: TcpStream, config: &HandshakeConfig) -> Result<TcpStream, HandshakeError> {
    stream.set_nonblocking(false).map_err(HandshakeError::Socket)?;
    stream
        .set_read_timeout(config.read_timeout())
        .map_err(HandshakeError::Socket)?;

    perform(&mut stream, config)?;

    stream.set_read_timeout(None).map_err(HandshakeError::Socket)?;
    stream.set_nonblocking(true).map_err(HandshakeError::Socket)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    /// Serves scripted read results and records everything written.
    struct ScriptedStream {
        reads: VecDeque<io::Result<Vec<u8>>>,
        written: Vec<u8>,
        fail_writes: bool,
    }

    impl ScriptedStream {
        fn new(reads: Vec<io::Result<Vec<u8>>>) -> Self {
            Self {
                reads: reads.into(),
                written: Vec::new(),
                fail_writes: false,
            }
        }

        fn written(&self) -> String {
            String::from_utf8_lossy(&self.written).into_owned()
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail_writes {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn request(key: &str) -> Vec<u8> {
        format!(
            "GET /chat HTTP/1.1\r\n\
             Host: localhost\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n",
            key
        )
        .into_bytes()
    }

    #[test]
    fn test_accept_key_rfc_example() {
        assert_eq!(compute_accept_key(SAMPLE_KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_extract_key() {
        let req = String::from_utf8(request(SAMPLE_KEY)).unwrap();
        assert_eq!(extract_key(&req).unwrap(), SAMPLE_KEY);

        let lower = "GET / HTTP/1.1\r\nsec-websocket-key: abc==\r\n\r\n";
        assert_eq!(extract_key(lower).unwrap(), "abc==");
    }

    #[test]
    fn test_extract_key_missing() {
        let req = "GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert!(matches!(extract_key(req), Err(HandshakeError::MissingKey)));

        // no CRLF after the header line
        let unterminated = "GET / HTTP/1.1\r\nSec-WebSocket-Key: abc==";
        assert!(matches!(extract_key(unterminated), Err(HandshakeError::MissingKey)));
    }

    #[test]
    fn test_perform_writes_exact_response() {
        let mut stream = ScriptedStream::new(vec![Ok(request(SAMPLE_KEY))]);
        perform(&mut stream, &HandshakeConfig::default()).unwrap();

        assert_eq!(
            stream.written(),
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n"
        );
    }

    #[test]
    fn test_perform_retries_then_succeeds() {
        let req = request(SAMPLE_KEY);
        let (head, tail) = req.split_at(20);
        let mut stream = ScriptedStream::new(vec![
            Err(io::Error::from(io::ErrorKind::Interrupted)),
            Err(io::Error::from(io::ErrorKind::WouldBlock)),
            Ok(head.to_vec()),
            Ok(tail.to_vec()),
        ]);
        perform(&mut stream, &HandshakeConfig::default()).unwrap();
        assert!(stream.written().contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    #[test]
    fn test_perform_bounded_retries() {
        let config = HandshakeConfig {
            max_read_retries: 3,
            ..HandshakeConfig::default()
        };
        let mut stream = ScriptedStream::new(vec![]);
        let result = perform(&mut stream, &config);
        assert!(matches!(result, Err(HandshakeError::RetriesExhausted(3))));
        assert!(stream.written.is_empty());
    }

    #[test]
    fn test_perform_peer_closed() {
        let mut stream = ScriptedStream::new(vec![Ok(Vec::new())]);
        let result = perform(&mut stream, &HandshakeConfig::default());
        assert!(matches!(result, Err(HandshakeError::ConnectionClosed)));
    }

    #[test]
    fn test_perform_request_too_large() {
        let config = HandshakeConfig {
            read_budget: 16,
            ..HandshakeConfig::default()
        };
        let mut stream = ScriptedStream::new(vec![Ok(request(SAMPLE_KEY))]);
        let result = perform(&mut stream, &config);
        assert!(matches!(result, Err(HandshakeError::RequestTooLarge(16))));
    }

    #[test]
    fn test_perform_missing_key_writes_bad_request() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec();
        let mut stream = ScriptedStream::new(vec![Ok(req)]);
        let result = perform(&mut stream, &HandshakeConfig::default());
        assert!(matches!(result, Err(HandshakeError::MissingKey)));
        assert!(stream.written().starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn test_perform_write_failure() {
        let mut stream = ScriptedStream::new(vec![Ok(request(SAMPLE_KEY))]);
        stream.fail_writes = true;
        let result = perform(&mut stream, &HandshakeConfig::default());
        assert!(matches!(result, Err(HandshakeError::Write(_))));
    }

    #[test]
    fn test_accept_silent_client_is_bounded() {
        use std::net::TcpListener;
        use std::time::{Duration, Instant};

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();

        let config = HandshakeConfig::default();
        let started = Instant::now();
        let result = accept(stream, &config);
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(HandshakeError::RetriesExhausted(3))));
        let budget = config.read_timeout().unwrap() * config.max_read_retries;
        assert!(elapsed >= budget - Duration::from_millis(50), "gave up after {:?}", elapsed);
        assert!(elapsed < budget + Duration::from_secs(1), "stalled for {:?}", elapsed);
    }
}
