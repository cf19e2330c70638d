//! HTTP upgrade handshake
//!
//! Reads the upgrade request off a fresh socket, validates it and builds the
//! raw HTTP response: 101 on success, 400 for a bad or non-upgrade request,
//! 426 when the client asks for a WebSocket version other than 13.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

use super::protocol::{
    RelayError, RelayResult, MAX_REQUEST_SIZE, UPGRADE_PROTOCOL, WEBSOCKET_VERSION,
};

/// Maximum number of headers accepted on a request
const MAX_HEADERS: usize = 64;

/// A fully read HTTP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    /// Request target, including any query string
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Request path without the query string
    pub fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or_default()
    }

    /// Raw query string, if any
    pub fn query(&self) -> Option<&str> {
        self.uri.split_once('?').map(|(_, query)| query)
    }
}

/// Try to parse a complete request from `buf`
///
/// Returns `None` while more bytes are needed, otherwise the request and the
/// number of bytes it occupied.
pub fn parse_request(buf: &[u8]) -> RelayResult<Option<(HttpRequest, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);

    let head_len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(RelayError::ProtocolNegotiation(e.to_string())),
    };

    let method = parsed.method.unwrap_or_default().to_string();
    let uri = parsed.path.unwrap_or_default().to_string();
    let headers = parsed
        .headers
        .iter()
        .map(|header| {
            let value = std::str::from_utf8(header.value).map_err(|_| {
                RelayError::ProtocolNegotiation(format!("header {} is not UTF-8", header.name))
            })?;
            Ok((header.name.to_string(), value.trim().to_string()))
        })
        .collect::<RelayResult<Vec<_>>>()?;

    let mut request = HttpRequest {
        method,
        uri,
        headers,
        body: Vec::new(),
    };

    if request.header("transfer-encoding").is_some() {
        return Err(RelayError::ProtocolNegotiation(
            "chunked request bodies are not supported".to_string(),
        ));
    }

    let content_length = match request.header("content-length") {
        Some(value) => value.parse::<usize>().map_err(|_| {
            RelayError::ProtocolNegotiation(format!("invalid Content-Length {:?}", value))
        })?,
        None => 0,
    };

    if content_length > MAX_REQUEST_SIZE {
        return Err(RelayError::ProtocolNegotiation(format!(
            "Content-Length {} exceeds {} bytes",
            content_length, MAX_REQUEST_SIZE
        )));
    }

    let total = head_len.checked_add(content_length).ok_or_else(|| {
        RelayError::ProtocolNegotiation(format!("invalid Content-Length {}", content_length))
    })?;
    if buf.len() < total {
        return Ok(None);
    }

    request.body = buf[head_len..total].to_vec();
    Ok(Some((request, total)))
}

/// Read one request from the stream
///
/// Returns the request and any bytes the client sent after it.
pub async fn read_request<S>(stream: &mut S, max_size: usize) -> RelayResult<(HttpRequest, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        if let Some((request, consumed)) = parse_request(&buf)? {
            let leftover = buf.split_off(consumed);
            return Ok((request, leftover));
        }

        if buf.len() >= max_size {
            return Err(RelayError::ProtocolNegotiation(format!(
                "request exceeds {} bytes",
                max_size
            )));
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before request completed",
            )
            .into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Validate an upgrade request and derive the `Sec-WebSocket-Accept` value
pub fn negotiate(request: &HttpRequest, endpoint_path: &str) -> RelayResult<String> {
    let upgrade = request.header("upgrade").unwrap_or_default();
    if !upgrade.eq_ignore_ascii_case(UPGRADE_PROTOCOL) {
        return Err(RelayError::ProtocolNegotiation(format!(
            "expected Upgrade: {}, got {:?}",
            UPGRADE_PROTOCOL, upgrade
        )));
    }

    if request.method != "GET" {
        return Err(RelayError::ProtocolNegotiation(format!(
            "upgrade requires GET, got {}",
            request.method
        )));
    }

    if request.path() != endpoint_path {
        return Err(RelayError::ProtocolNegotiation(format!(
            "no endpoint at {}",
            request.path()
        )));
    }

    let version = request.header("sec-websocket-version").unwrap_or_default();
    if version != WEBSOCKET_VERSION {
        return Err(RelayError::UnsupportedVersion(version.to_string()));
    }

    let key = request
        .header("sec-websocket-key")
        .filter(|key| !key.is_empty())
        .ok_or_else(|| RelayError::ProtocolNegotiation("missing Sec-WebSocket-Key".to_string()))?;

    Ok(derive_accept_key(key.as_bytes()))
}

/// A raw HTTP response written before the protocol switch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    fn new(status: u16, reason: &'static str) -> Self {
        Self {
            status,
            reason,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// Completes the handshake
    pub fn switching_protocols(accept_key: &str) -> Self {
        Self::new(101, "Switching Protocols")
            .with_header("Upgrade", UPGRADE_PROTOCOL)
            .with_header("Connection", "Upgrade")
            .with_header("Sec-WebSocket-Accept", accept_key)
    }

    /// Rejects a malformed or non-upgrade request. The body is the status line.
    pub fn bad_request() -> Self {
        let mut response = Self::new(400, "Bad Request").with_header("Connection", "close");
        response.body = b"400 Bad Request".to_vec();
        response
    }

    /// Rejects an unsupported WebSocket version, advertising the one we speak
    pub fn unsupported_version() -> Self {
        Self::new(426, "Upgrade Required")
            .with_header("Sec-WebSocket-Version", WEBSOCKET_VERSION)
            .with_header("Connection", "close")
    }

    /// Response matching a negotiation fault
    pub fn rejection(err: &RelayError) -> Self {
        match err {
            RelayError::UnsupportedVersion(_) => Self::unsupported_version(),
            _ => Self::bad_request(),
        }
    }

    /// Whether the protocol switch was accepted
    pub fn is_upgrade(&self) -> bool {
        self.status == 101
    }

    /// Encode as HTTP/1.1
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason);
        for (name, value) in &self.headers {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !self.is_upgrade() {
            out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        out.push_str("\r\n");

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}
