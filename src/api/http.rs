//! Minimal HTTP/1.1 request reading and response building.
//!
//! One request per connection; the connection closes after the response.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Largest request body accepted
pub const MAX_BODY_BYTES: usize = 64 * 1024;

const MAX_HEADER_LINES: usize = 100;
const MAX_LINE_BYTES: u64 = 8 * 1024;

/// A parsed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    /// Path without the query string
    pub path: String,
    pub origin: Option<String>,
    pub body: Vec<u8>,
}

/// Why a request could not be read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// Peer closed before sending a request line
    Closed,
    Malformed(&'static str),
    BodyTooLarge,
}

impl ReadError {
    pub fn response(&self) -> Option<Response> {
        match self {
            ReadError::Closed => None,
            ReadError::Malformed(reason) => Some(Response::detail(400, reason)),
            ReadError::BodyTooLarge => Some(Response::detail(413, "Request body too large")),
        }
    }
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>, ReadError> {
    let mut raw = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE_BYTES)
        .read_until(b'\n', &mut raw)
        .await
        .map_err(|_| ReadError::Malformed("Failed to read request"))?;
    if n == 0 {
        return Ok(None);
    }
    if !raw.ends_with(b"\n") {
        return Err(ReadError::Malformed("Header line too long"));
    }
    String::from_utf8(raw)
        .map(|line| Some(line.trim_end_matches(['\r', '\n']).to_string()))
        .map_err(|_| ReadError::Malformed("Request is not valid UTF-8"))
}

/// Read one request: request line, headers, then `Content-Length` bytes of body.
pub async fn read_request<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Request, ReadError> {
    let request_line = match read_line(reader).await? {
        Some(line) if !line.trim().is_empty() => line,
        _ => return Err(ReadError::Closed),
    };

    // Parse method and path from "GET /path HTTP/1.1"
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(ReadError::Malformed("Malformed request line"));
    }
    let method = parts[0].to_ascii_uppercase();
    let path = parts[1].split('?').next().unwrap_or(parts[1]).to_string();

    let mut content_length = 0usize;
    let mut origin = None;
    let mut lines = 0;
    loop {
        let Some(line) = read_line(reader).await? else {
            return Err(ReadError::Malformed("Unexpected end of headers"));
        };
        if line.is_empty() {
            break;
        }
        lines += 1;
        if lines > MAX_HEADER_LINES {
            return Err(ReadError::Malformed("Too many headers"));
        }

        let Some((name, value)) = line.split_once(':') else {
            return Err(ReadError::Malformed("Malformed header"));
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value
                .parse()
                .map_err(|_| ReadError::Malformed("Invalid Content-Length"))?;
        } else if name.eq_ignore_ascii_case("origin") {
            origin = Some(value.to_string());
        }
    }

    if content_length > MAX_BODY_BYTES {
        return Err(ReadError::BodyTooLarge);
    }
    let mut body = vec![0u8; content_length];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|_| ReadError::Malformed("Incomplete request body"))?;

    Ok(Request {
        method,
        path,
        origin,
        body,
    })
}

/// A response waiting for its CORS decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl Response {
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: value.to_string().into_bytes(),
        }
    }

    pub fn serialized<T: serde::Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self {
                status,
                content_type: "application/json",
                body,
            },
            Err(e) => Self::detail(500, &format!("Failed to encode response: {}", e)),
        }
    }

    /// `{"detail": "..."}` error body
    pub fn detail(status: u16, message: &str) -> Self {
        Self::json(status, &serde_json::json!({ "detail": message }))
    }

    pub fn success() -> Self {
        Self::json(200, &serde_json::json!({ "status": "success" }))
    }

    pub fn no_content() -> Self {
        Self {
            status: 204,
            content_type: "text/plain",
            body: Vec::new(),
        }
    }

    /// Serialize with an `Access-Control-Allow-Origin` header when `allow_origin` is set.
    pub fn to_bytes(&self, allow_origin: Option<&str>) -> Vec<u8> {
        let mut header = format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n\
             Cache-Control: no-cache\r\n\
             Connection: close\r\n",
            self.status,
            reason_phrase(self.status),
            self.content_type,
            self.body.len()
        );
        if let Some(origin) = allow_origin {
            header.push_str(&format!(
                "Access-Control-Allow-Origin: {}\r\n\
                 Access-Control-Allow-Credentials: true\r\n\
                 Access-Control-Allow-Methods: GET, POST, DELETE, OPTIONS\r\n\
                 Access-Control-Allow-Headers: *\r\n\
                 Vary: Origin\r\n",
                origin
            ));
        }
        header.push_str("\r\n");

        let mut resp = header.into_bytes();
        resp.extend_from_slice(&self.body);
        resp
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::BufReader;

    use super::*;

    async fn parse(raw: &[u8]) -> Result<Request, ReadError> {
        let mut reader = BufReader::new(raw);
        read_request(&mut reader).await
    }

    #[tokio::test]
    async fn test_read_request_with_body() {
        let raw = b"POST /mappings?x=1 HTTP/1.1\r\nHost: localhost\r\nOrigin: http://localhost:5173\r\ncontent-length: 2\r\n\r\n{}";
        let request = parse(raw).await.unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/mappings");
        assert_eq!(request.origin.as_deref(), Some("http://localhost:5173"));
        assert_eq!(request.body, b"{}");
    }

    #[tokio::test]
    async fn test_read_request_errors() {
        assert_eq!(parse(b"").await, Err(ReadError::Closed));
        assert_eq!(
            parse(b"GARBAGE\r\n\r\n").await,
            Err(ReadError::Malformed("Malformed request line"))
        );
        assert_eq!(
            parse(b"POST / HTTP/1.1\r\nContent-Length: abc\r\n\r\n").await,
            Err(ReadError::Malformed("Invalid Content-Length"))
        );
        assert_eq!(
            parse(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n{}").await,
            Err(ReadError::Malformed("Incomplete request body"))
        );

        let oversized = format!(
            "POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            MAX_BODY_BYTES + 1
        );
        assert_eq!(
            parse(oversized.as_bytes()).await,
            Err(ReadError::BodyTooLarge)
        );
    }

    #[test]
    fn test_response_bytes() {
        let bytes = Response::success().to_bytes(None);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(!text.contains("Access-Control-Allow-Origin"));
        assert!(text.ends_with("\r\n\r\n{\"status\":\"success\"}"));

        let text = String::from_utf8(Response::no_content().to_bytes(Some("http://a.test"))).unwrap();
        assert!(text.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(text.contains("Access-Control-Allow-Origin: http://a.test\r\n"));
    }
}
