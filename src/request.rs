//! Parsing of the one HTTP request a proxied connection opens with.
//!
//! ```text
//!   CONNECT example.com:443 HTTP/1.1        ──► host from the request line
//!
//!   GET http://example.com/ HTTP/1.1        ──► host from the Host header
//!   Host: example.com                           (default port 80)
//!
//!   POST http://example.com/form HTTP/1.1   ──► Content-Length bytes of body
//!   Host: example.com
//!   Content-Length: 11
//! ```

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::error::{Error, Result};

/// Upper bound on the size of the request line plus headers.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Upper bound on a buffered POST body.
pub const MAX_BODY_BYTES: u64 = 16 * 1024 * 1024;

/// The parsed request header of one proxied connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    /// The full request line, e.g. `GET http://example.com/ HTTP/1.1`.
    pub request_line: String,
    /// Headers in arrival order; a repeated name replaces the earlier value.
    pub headers: Vec<(String, String)>,
    /// Destination host.
    pub host: String,
    /// Destination port.
    pub port: u16,
    /// HTTP version echoed in the CONNECT reply.
    pub http_version: String,
    /// POST body, empty for every other method.
    pub body: Vec<u8>,
    /// The client sent `Proxy-Connection: keep-alive`.
    pub keep_alive: bool,
}

impl ProxyRequest {
    /// Reads and parses the request header from `reader`.
    ///
    /// For POST the body is read as well. Bytes past the header that are not
    /// part of a POST body stay in the reader's buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProxyRequest`] for a missing request line, a POST
    /// without `Content-Length`, a CONNECT without a target, a request
    /// without a `Host` header, or an invalid port.
    pub async fn read<R>(reader: &mut BufReader<R>) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = Vec::new();
        let mut total = 0;
        loop {
            if total >= MAX_HEADER_BYTES {
                return Err(Error::ProxyRequest("request header is too large".to_string()));
            }
            let mut line = String::new();
            let limit = (MAX_HEADER_BYTES - total) as u64;
            let read = (&mut *reader).take(limit).read_line(&mut line).await?;
            if read == 0 {
                break;
            }
            total += read;
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            if line.trim().is_empty() {
                break;
            }
            lines.push(line);
        }

        let mut request = Self::parse_header(&lines)?;

        if request.method().eq_ignore_ascii_case("POST") {
            let length: u64 = request
                .header("Content-Length")
                .ok_or_else(|| {
                    Error::ProxyRequest("POST request carries no Content-Length".to_string())
                })?
                .parse()
                .map_err(|_| Error::ProxyRequest("invalid Content-Length".to_string()))?;
            if length > MAX_BODY_BYTES {
                return Err(Error::ProxyRequest(format!(
                    "POST body of {} bytes is too large",
                    length
                )));
            }
            let mut body = vec![0u8; length as usize];
            reader.read_exact(&mut body).await.map_err(|_| {
                Error::ProxyRequest("connection closed while reading the POST body".to_string())
            })?;
            request.body = body;
        }

        Ok(request)
    }

    /// Parses a request line followed by header lines.
    pub fn parse_header<S: AsRef<str>>(lines: &[S]) -> Result<Self> {
        let request_line = lines
            .first()
            .map(|l| l.as_ref().trim().to_string())
            .filter(|l| !l.is_empty())
            .ok_or_else(|| {
                Error::ProxyRequest("connection did not supply an HTTP header".to_string())
            })?;

        let mut headers: Vec<(String, String)> = Vec::new();
        for line in lines.iter().skip(1) {
            let Some((name, value)) = line.as_ref().trim().split_once(':') else {
                continue;
            };
            let (name, value) = (name.trim(), value.trim());
            match headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
                Some(existing) => existing.1 = value.to_string(),
                None => headers.push((name.to_string(), value.to_string())),
            }
        }

        let mut request = Self {
            request_line,
            headers,
            host: String::new(),
            port: 80,
            http_version: "HTTP/1.1".to_string(),
            body: Vec::new(),
            keep_alive: false,
        };
        request.keep_alive = request
            .header("Proxy-Connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("keep-alive"));

        if request.is_connect() {
            let parts: Vec<&str> = request.request_line.split(' ').collect();
            if parts.len() < 3 {
                return Err(Error::ProxyRequest(
                    "CONNECT request has too few parameters".to_string(),
                ));
            }
            let (host, port) = parse_authority(parts[1], 443)?;
            request.http_version = parts[2].to_string();
            request.host = host;
            request.port = port;
        } else {
            let target = request
                .header("Host")
                .ok_or_else(|| Error::ProxyRequest("request carries no Host header".to_string()))?;
            let (host, port) = parse_authority(target, 80)?;
            request.host = host;
            request.port = port;
        }

        Ok(request)
    }

    /// The request method, e.g. `GET`.
    pub fn method(&self) -> &str {
        self.request_line.split(' ').next().unwrap_or("")
    }

    /// Returns true for a CONNECT tunnel.
    pub fn is_connect(&self) -> bool {
        self.method().eq_ignore_ascii_case("CONNECT")
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The header block forwarded to the destination, without `Proxy-*`
    /// headers.
    pub fn forward_header(&self) -> String {
        let mut header = String::with_capacity(self.request_line.len() + 256);
        header.push_str(&self.request_line);
        header.push_str("\r\n");
        for (name, value) in &self.headers {
            if name
                .get(..5)
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case("proxy"))
            {
                continue;
            }
            header.push_str(name);
            header.push_str(": ");
            header.push_str(value);
            header.push_str("\r\n");
        }
        header.push_str("\r\n");
        header
    }
}

/// Splits `host[:port]`, accepting a bracketed IPv6 host.
fn parse_authority(value: &str, default_port: u16) -> Result<(String, u16)> {
    let value = value.trim();
    let (host, port) = match value.strip_prefix('[') {
        Some(rest) => {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| Error::ProxyRequest(format!("invalid host: {}", value)))?;
            (host, after.strip_prefix(':'))
        }
        None => match value.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (value, None),
        },
    };

    if host.is_empty() {
        return Err(Error::ProxyRequest(format!("invalid host: {}", value)));
    }
    let port = match port {
        Some(port) => port
            .parse()
            .map_err(|_| Error::ProxyRequest(format!("invalid port in {}", value)))?,
        None => default_port,
    };
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read(raw: &str) -> Result<ProxyRequest> {
        let mut reader = BufReader::new(raw.as_bytes());
        ProxyRequest::read(&mut reader).await
    }

    #[tokio::test]
    async fn test_plain_get() {
        let request = read("GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        assert!(request.request_line.starts_with("GET"));
        assert_eq!(request.method(), "GET");
        assert_eq!(request.host, "example.com");
        assert_eq!(request.port, 80);
        assert!(!request.is_connect());
    }

    #[tokio::test]
    async fn test_connect() {
        let request = read("CONNECT example.com:443 HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(request.host, "example.com");
        assert_eq!(request.port, 443);
        assert_eq!(request.http_version, "HTTP/1.1");
        assert!(request.is_connect());

        let request = read("CONNECT example.com HTTP/1.0\r\n\r\n").await.unwrap();
        assert_eq!(request.port, 443);
        assert_eq!(request.http_version, "HTTP/1.0");
    }

    #[tokio::test]
    async fn test_post_body() {
        let mut reader = BufReader::new(
            &b"POST http://h/ HTTP/1.1\r\nHost: h:8080\r\nContent-Length: 5\r\n\r\nhelloEXTRA"[..],
        );
        let request = ProxyRequest::read(&mut reader).await.unwrap();
        assert_eq!(request.port, 8080);
        assert_eq!(request.body, b"hello");
        assert_eq!(reader.buffer(), b"EXTRA");
    }

    #[tokio::test]
    async fn test_failures() {
        assert!(read("").await.is_err());
        assert!(read("POST http://h/ HTTP/1.1\r\nHost: h\r\n\r\n").await.is_err());
        assert!(read("GET / HTTP/1.1\r\n\r\n").await.is_err());
        assert!(read("CONNECT example.com:443\r\n\r\n").await.is_err());
        assert!(read("CONNECT example.com:https HTTP/1.1\r\n\r\n").await.is_err());
        assert!(read("POST http://h/ HTTP/1.1\r\nHost: h\r\nContent-Length: 9\r\n\r\nshort")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unterminated_line_is_capped() {
        let mut reader = BufReader::new(tokio::io::repeat(b'a'));
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            ProxyRequest::read(&mut reader),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(Error::ProxyRequest(_))));
    }

    #[tokio::test]
    async fn test_keep_alive_flag() {
        let request = read("GET http://h/ HTTP/1.1\r\nHost: h\r\nProxy-Connection: Keep-Alive\r\n\r\n")
            .await
            .unwrap();
        assert!(request.keep_alive);
        assert!(!request.forward_header().contains("Keep-Alive"));

        let request = read("CONNECT h:443 HTTP/1.1\r\nProxy-Connection: close\r\n\r\n")
            .await
            .unwrap();
        assert!(!request.keep_alive);
    }

    #[test]
    fn test_forward_header_strips_proxy_headers() {
        let request = ProxyRequest::parse_header(&[
            "GET http://example.com/ HTTP/1.1",
            "Host: example.com",
            "Proxy-Connection: keep-alive",
            "proxy-authorization: x",
            "Accept: */*",
            "host: example.com:81",
        ])
        .unwrap();
        assert_eq!(request.port, 81);
        assert_eq!(request.header("PROXY-CONNECTION"), Some("keep-alive"));
        assert_eq!(
            request.forward_header(),
            "GET http://example.com/ HTTP/1.1\r\nHost: example.com:81\r\nAccept: */*\r\n\r\n"
        );
    }

    #[test]
    fn test_parse_authority() {
        assert_eq!(parse_authority("[::1]:8080", 80).unwrap(), ("::1".to_string(), 8080));
        assert_eq!(parse_authority("[::1]", 80).unwrap(), ("::1".to_string(), 80));
        assert!(parse_authority(":80", 80).is_err());
    }
}
