//! Minimal HTTP/1.1 parsing and response writing
//!
//! The server speaks just enough HTTP for its two routes: request line,
//! headers, and a content-length body. Responses always close the
//! connection, which is also how the NDJSON stream is framed.

use provd_errors::{Error, ServerError};
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// One parsed inbound request
#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    /// Header names lowercased
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Upper bound on the request line plus all headers; everything past it
/// is treated as malformed rather than buffered
const MAX_HEAD_BYTES: u64 = 8 * 1024;

/// Read and parse one request from the connection
///
/// # Errors
/// Returns [`ServerError::MalformedRequest`] on anything that is not a
/// well-formed request, and [`ServerError::BodyTooLarge`] when the declared
/// body exceeds `max_body_bytes`.
pub async fn read_request<R>(reader: &mut R, max_body_bytes: usize) -> Result<HttpRequest, Error>
where
    R: AsyncBufReadExt + Unpin,
{
    // The head is read through a byte limit so a client feeding an endless
    // line cannot grow the buffer; a line cut off at the limit arrives
    // without its newline and is rejected below.
    let mut head = (&mut *reader).take(MAX_HEAD_BYTES);

    let mut line = String::new();
    head.read_line(&mut line)
        .await
        .map_err(|e| malformed(&format!("failed to read request line: {e}")))?;
    if !line.ends_with('\n') {
        return Err(malformed("request line truncated or too long"));
    }

    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| malformed("empty request line"))?
        .to_string();
    let path = parts
        .next()
        .ok_or_else(|| malformed("request line without a path"))?
        .to_string();
    if !parts.next().is_some_and(|v| v.starts_with("HTTP/1.")) {
        return Err(malformed("not an HTTP/1.x request"));
    }

    let mut headers = HashMap::new();
    loop {
        let mut header_line = String::new();
        head.read_line(&mut header_line)
            .await
            .map_err(|e| malformed(&format!("failed to read header: {e}")))?;
        if !header_line.ends_with('\n') {
            return Err(malformed("header block truncated or too long"));
        }
        let trimmed = header_line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| malformed("header without a colon"))?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }
    drop(head);

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| malformed("invalid content-length"))?,
        None => 0,
    };
    if content_length > max_body_bytes {
        return Err(ServerError::BodyTooLarge {
            size: content_length,
            limit: max_body_bytes,
        }
        .into());
    }

    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader
            .read_exact(&mut body)
            .await
            .map_err(|e| malformed(&format!("body shorter than content-length: {e}")))?;
    }

    Ok(HttpRequest {
        method,
        path,
        headers,
        body,
    })
}

fn malformed(message: &str) -> Error {
    ServerError::MalformedRequest(message.to_string()).into()
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        429 => "Too Many Requests",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

/// Write a complete response with a body and close-framing headers
pub async fn write_response<W>(
    writer: &mut W,
    status: u16,
    extra_headers: &[(&str, String)],
    content_type: &str,
    body: &[u8],
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n",
        reason(status),
        body.len()
    );
    for (name, value) in extra_headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Write a JSON response
pub async fn write_json<W>(
    writer: &mut W,
    status: u16,
    value: &serde_json::Value,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = value.to_string();
    write_response(writer, status, &[], "application/json", body.as_bytes()).await
}

/// Write the response head for an NDJSON event stream
///
/// No content length: the stream ends when the server closes the
/// connection after the terminal record.
pub async fn write_stream_head<W>(writer: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(
            b"HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nConnection: close\r\n\r\n",
        )
        .await?;
    writer.flush().await
}
