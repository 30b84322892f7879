//! Minimal HTTP/1.1 wire handling: request head parsing, fixed-length and
//! chunked responses. One request per connection.

use std::collections::HashMap;
use std::io::{self, Chain, Cursor, Read, Take, Write};
use thiserror::Error;

pub const MAX_HEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error("request head too large")]
    HeadTooLarge,
    #[error("connection closed before a full request head")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl HttpError {
    pub fn status(&self) -> u16 {
        match self {
            HttpError::BadRequest(_) => 400,
            HttpError::HeadTooLarge => 431,
            HttpError::Closed | HttpError::Io(_) => 400,
        }
    }
}

#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    headers: HashMap<String, String>,
    /// Body bytes read together with the head.
    leftover: Vec<u8>,
}

pub type BodyReader<'a, S> = Chain<Cursor<Vec<u8>>, Take<&'a mut S>>;

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn content_length(&self) -> Result<Option<u64>, HttpError> {
        match self.header("content-length") {
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| HttpError::BadRequest("invalid Content-Length".to_string())),
            None => Ok(None),
        }
    }

    /// Exactly `Content-Length` body bytes: what came with the head, then
    /// the rest of the stream. Chunked request bodies are not accepted.
    pub fn body<'a, S: Read>(&mut self, stream: &'a mut S) -> Result<BodyReader<'a, S>, HttpError> {
        if self
            .header("transfer-encoding")
            .is_some_and(|value| !value.eq_ignore_ascii_case("identity"))
        {
            return Err(HttpError::BadRequest(
                "chunked request bodies are not supported".to_string(),
            ));
        }
        let length = self.content_length()?.unwrap_or(0);
        let mut leftover = std::mem::take(&mut self.leftover);
        leftover.truncate(usize::try_from(length).unwrap_or(usize::MAX));
        let remaining = length - leftover.len() as u64;
        Ok(Cursor::new(leftover).chain(stream.take(remaining)))
    }
}

pub fn read_head<S: Read>(stream: &mut S) -> Result<HttpRequest, HttpError> {
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let head_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(HttpError::Closed);
        }
        let searched_from = data.len().saturating_sub(3);
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data[searched_from..]
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
        {
            break searched_from + pos;
        }
        if data.len() > MAX_HEAD_BYTES {
            return Err(HttpError::HeadTooLarge);
        }
    };
    if head_end > MAX_HEAD_BYTES {
        return Err(HttpError::HeadTooLarge);
    }
    let leftover = data.split_off(head_end + 4);
    let text = std::str::from_utf8(&data[..head_end])
        .map_err(|_| HttpError::BadRequest("request head is not UTF-8".to_string()))?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| HttpError::BadRequest("empty request".to_string()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| HttpError::BadRequest("missing method".to_string()))?;
    let raw_path = parts
        .next()
        .ok_or_else(|| HttpError::BadRequest("missing path".to_string()))?;
    let mut headers = HashMap::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpError::BadRequest(format!("invalid header line {line:?}")))?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        leftover,
    })
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        413 => "Payload Too Large",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

fn write_head<W: Write>(
    out: &mut W,
    status: u16,
    content_type: &str,
    headers: &[(&str, String)],
) -> io::Result<()> {
    let mut head = format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: {content_type}\r\n\
         Cache-Control: no-store\r\nConnection: close\r\n",
        status_text(status)
    );
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    out.write_all(head.as_bytes())
}

pub fn write_response<W: Write>(
    out: &mut W,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> io::Result<()> {
    write_head(
        out,
        status,
        content_type,
        &[("Content-Length", body.len().to_string())],
    )?;
    out.write_all(body)?;
    out.flush()
}

pub fn write_json<W: Write>(out: &mut W, status: u16, body: &serde_json::Value) -> io::Result<()> {
    let payload = serde_json::to_vec(body).map_err(io::Error::from)?;
    write_response(out, status, "application/json", &payload)
}

/// Writes the head of a fixed-length streamed body; the caller then writes
/// exactly `length` bytes.
pub fn start_sized<W: Write>(
    out: &mut W,
    status: u16,
    content_type: &str,
    length: u64,
    headers: &[(&str, String)],
) -> io::Result<()> {
    let mut all = vec![("Content-Length", length.to_string())];
    all.extend(headers.iter().cloned());
    write_head(out, status, content_type, &all)
}

pub fn start_chunked<W: Write>(
    out: W,
    status: u16,
    content_type: &str,
) -> io::Result<ChunkedWriter<W>> {
    let mut out = out;
    write_head(
        &mut out,
        status,
        content_type,
        &[("Transfer-Encoding", "chunked".to_string())],
    )?;
    Ok(ChunkedWriter { inner: out })
}

/// `Transfer-Encoding: chunked` body writer. Every `write` is one chunk.
pub struct ChunkedWriter<W: Write> {
    inner: W,
}

impl<W: Write> ChunkedWriter<W> {
    pub fn finish(mut self) -> io::Result<W> {
        self.inner.write_all(b"0\r\n\r\n")?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for ChunkedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        write!(self.inner, "{:x}\r\n", buf.len())?;
        self.inner.write_all(buf)?;
        self.inner.write_all(b"\r\n")?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
