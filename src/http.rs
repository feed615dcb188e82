//! Minimal blocking HTTP/1.1 framing over `TcpStream`.
//!
//! Just enough of the protocol for the store surface and the balancer:
//! request line + headers + `Content-Length` body in, status line +
//! headers + body out, one exchange per connection (`Connection: close`).
//! Chunked transfer encoding is not supported; a response without a
//! `Content-Length` is read to end of stream.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::{KvError, Result};

/// upper bound on a request body we are willing to buffer
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// One parsed HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    /// request method, uppercase (`GET`, `POST`, ...)
    pub method: String,
    /// path component of the request target, e.g. `/db/foo`
    pub path: String,
    /// raw query string without the leading `?`, if any
    pub query: Option<String>,
    /// headers in arrival order, names lowercased
    pub headers: Vec<(String, String)>,
    /// the request body
    pub body: Vec<u8>,
}

impl Request {
    /// Builds a bodyless request for `method` and `target`
    /// (path plus optional `?query`).
    pub fn new(method: &str, target: &str) -> Request {
        let (path, query) = split_target(target);
        Request {
            method: method.to_uppercase(),
            path,
            query,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Attaches a body.
    pub fn with_body(mut self, body: Vec<u8>) -> Request {
        self.body = body;
        self
    }

    /// first value of a header, looked up case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        header_lookup(&self.headers, name)
    }

    /// the request target: path plus `?query` when present
    pub fn target(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    /// decoded value of one query parameter, if present
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        for pair in query.split('&') {
            let mut it = pair.splitn(2, '=');
            let k = it.next().unwrap_or("");
            if k == name {
                return Some(it.next().unwrap_or("").to_string());
            }
        }
        None
    }
}

/// One HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    /// numeric status code
    pub status: u16,
    /// headers in arrival order, names lowercased
    pub headers: Vec<(String, String)>,
    /// the response body
    pub body: Vec<u8>,
}

impl Response {
    /// Builds a bodyless response with the given status.
    pub fn new(status: u16) -> Response {
        Response {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Builds a `text/plain` response.
    pub fn text(status: u16, body: &str) -> Response {
        Response::new(status)
            .with_header("content-type", "text/plain; charset=utf-8")
            .with_body(body.as_bytes().to_vec())
    }

    /// Builds an `application/json` response.
    pub fn json(status: u16, body: Vec<u8>) -> Response {
        Response::new(status)
            .with_header("content-type", "application/json")
            .with_body(body)
    }

    /// Appends a header.
    pub fn with_header(mut self, name: &str, value: &str) -> Response {
        self.headers.push((name.to_lowercase(), value.to_string()));
        self
    }

    /// Attaches a body.
    pub fn with_body(mut self, body: Vec<u8>) -> Response {
        self.body = body;
        self
    }

    /// first value of a header, looked up case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        header_lookup(&self.headers, name)
    }
}

/// Reads one request from a connection.
///
/// Returns `Ok(None)` when the peer closed the connection before sending
/// anything; a torn request line or header block is an error.
pub fn read_request<R: BufRead>(reader: &mut R) -> Result<Option<Request>> {
    let request_line = match read_line(reader)? {
        Some(line) => line,
        None => return Ok(None),
    };
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| KvError::Parsing("empty request line".into()))?;
    let target = parts
        .next()
        .ok_or_else(|| KvError::Parsing(format!("malformed request line: {}", request_line)))?;
    let (path, query) = split_target(target);

    let headers = read_headers(reader)?;
    let body = read_sized_body(reader, &headers)?;

    Ok(Some(Request {
        method: method.to_uppercase(),
        path,
        query,
        headers,
        body,
    }))
}

/// Writes a response, always closing the connection afterwards.
///
/// The framing headers (`content-length`, `connection`,
/// `transfer-encoding`) are recomputed from the in-memory body, so a
/// proxied response whose header list still carries the upstream's
/// framing is re-framed rather than doubled.
pub fn write_response<W: Write>(writer: &mut W, response: &Response) -> Result<()> {
    write!(
        writer,
        "HTTP/1.1 {} {}\r\n",
        response.status,
        reason_phrase(response.status)
    )?;
    for (name, value) in &response.headers {
        if matches!(
            name.as_str(),
            "content-length" | "connection" | "transfer-encoding"
        ) {
            continue;
        }
        write!(writer, "{}: {}\r\n", name, value)?;
    }
    write!(writer, "content-length: {}\r\n", response.body.len())?;
    write!(writer, "connection: close\r\n\r\n")?;
    writer.write_all(&response.body)?;
    writer.flush()?;
    Ok(())
}

/// A small blocking HTTP client with a per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpClient {
    timeout: Duration,
}

impl HttpClient {
    /// Builds a client whose connects, reads and writes are all bounded
    /// by `timeout`.
    pub fn new(timeout: Duration) -> HttpClient {
        HttpClient { timeout }
    }

    /// Sends `request` to `host` (a `host:port` string) and reads the
    /// full response.
    pub fn send(&self, host: &str, request: &Request) -> Result<Response> {
        let addr = resolve(host)?;
        let stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let mut writer = stream.try_clone()?;
        write!(
            writer,
            "{} {} HTTP/1.1\r\nhost: {}\r\n",
            request.method,
            request.target(),
            host
        )?;
        for (name, value) in &request.headers {
            // the host and framing headers are ours to set
            if matches!(name.as_str(), "host" | "content-length" | "connection") {
                continue;
            }
            write!(writer, "{}: {}\r\n", name, value)?;
        }
        write!(writer, "content-length: {}\r\n", request.body.len())?;
        write!(writer, "connection: close\r\n\r\n")?;
        writer.write_all(&request.body)?;
        writer.flush()?;

        let mut reader = BufReader::new(stream);
        read_response(&mut reader)
    }
}

/// Reads a full response: status line, headers, then either
/// `Content-Length` bytes or everything until the peer closes.
pub fn read_response<R: BufRead>(reader: &mut R) -> Result<Response> {
    let status_line = read_line(reader)?
        .ok_or_else(|| KvError::Parsing("connection closed before status line".into()))?;
    let mut parts = status_line.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| KvError::Parsing("empty status line".into()))?;
    if !version.starts_with("HTTP/") {
        return Err(KvError::Parsing(format!(
            "malformed status line: {}",
            status_line
        )));
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| KvError::Parsing(format!("malformed status line: {}", status_line)))?;

    let headers = read_headers(reader)?;
    let body = match content_length(&headers)? {
        Some(len) => {
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body)?;
            body
        }
        None => {
            let mut body = Vec::new();
            reader.read_to_end(&mut body)?;
            body
        }
    };

    Ok(Response {
        status,
        headers,
        body,
    })
}

/// Reads one CRLF-terminated line; `Ok(None)` on a clean end of stream.
fn read_line<R: BufRead>(reader: &mut R) -> Result<Option<String>> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        return Ok(None);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

/// Reads headers up to the blank line, lowercasing names.
fn read_headers<R: BufRead>(reader: &mut R) -> Result<Vec<(String, String)>> {
    let mut headers = Vec::new();
    loop {
        let line = read_line(reader)?
            .ok_or_else(|| KvError::Parsing("connection closed inside header block".into()))?;
        if line.is_empty() {
            return Ok(headers);
        }
        let mut it = line.splitn(2, ':');
        let name = it
            .next()
            .ok_or_else(|| KvError::Parsing(format!("malformed header: {}", line)))?
            .trim()
            .to_lowercase();
        let value = it.next().unwrap_or("").trim().to_string();
        headers.push((name, value));
    }
}

/// Reads a request body of exactly `Content-Length` bytes (zero when the
/// header is absent).
fn read_sized_body<R: BufRead>(reader: &mut R, headers: &[(String, String)]) -> Result<Vec<u8>> {
    match content_length(headers)? {
        None | Some(0) => Ok(Vec::new()),
        Some(len) => {
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body)?;
            Ok(body)
        }
    }
}

fn content_length(headers: &[(String, String)]) -> Result<Option<usize>> {
    match header_lookup(headers, "content-length") {
        None => Ok(None),
        Some(v) => {
            let len: usize = v
                .parse()
                .map_err(|_| KvError::Parsing(format!("bad content-length: {}", v)))?;
            if len > MAX_BODY_BYTES {
                return Err(KvError::Parsing(format!("body too large: {} bytes", len)));
            }
            Ok(Some(len))
        }
    }
}

fn header_lookup<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    let name = name.to_lowercase();
    headers
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, v)| v.as_str())
}

fn split_target(target: &str) -> (String, Option<String>) {
    match target.find('?') {
        Some(i) => (target[..i].to_string(), Some(target[i + 1..].to_string())),
        None => (target.to_string(), None),
    }
}

/// Resolves `host:port` to the first socket address it maps to.
fn resolve(host: &str) -> Result<SocketAddr> {
    host.to_socket_addrs()?
        .next()
        .ok_or_else(|| KvError::Parsing(format!("could not resolve upstream address {}", host)))
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_request_with_query_and_body() {
        let raw = b"POST /db/team?type=string HTTP/1.1\r\n\
                    Host: localhost\r\n\
                    Content-Length: 17\r\n\
                    \r\n\
                    {\"value\":\"hello\"}";
        let mut reader = BufReader::new(Cursor::new(raw.to_vec()));
        let req = read_request(&mut reader).unwrap().unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/db/team");
        assert_eq!(req.query_param("type").as_deref(), Some("string"));
        assert_eq!(req.header("host"), Some("localhost"));
        assert_eq!(req.body, b"{\"value\":\"hello\"}");
    }

    #[test]
    fn closed_connection_reads_as_none() {
        let mut reader = BufReader::new(Cursor::new(Vec::new()));
        assert!(read_request(&mut reader).unwrap().is_none());
    }

    #[test]
    fn response_round_trip() {
        let resp = Response::json(201, b"{\"key\":\"k\"}".to_vec()).with_header("lb-from", "a:1");
        let mut wire = Vec::new();
        write_response(&mut wire, &resp).unwrap();

        let mut reader = BufReader::new(Cursor::new(wire));
        let parsed = read_response(&mut reader).unwrap();
        assert_eq!(parsed.status, 201);
        assert_eq!(parsed.header("lb-from"), Some("a:1"));
        assert_eq!(parsed.header("content-type"), Some("application/json"));
        assert_eq!(parsed.body, b"{\"key\":\"k\"}");
    }

    #[test]
    fn response_without_length_reads_to_end() {
        let raw = b"HTTP/1.1 200 OK\r\nconnection: close\r\n\r\nhello";
        let mut reader = BufReader::new(Cursor::new(raw.to_vec()));
        let parsed = read_response(&mut reader).unwrap();
        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.body, b"hello");
    }
}
