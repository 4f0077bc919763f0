//! `multipart/mixed` batch envelopes: one HTTP request carrying several
//! `application/http` sub-requests.

use super::{reason_phrase, HttpRequest, HttpResponse};
use thiserror::Error;

/// Boundary used for batch responses minted by the engine.
pub const RESPONSE_BOUNDARY: &str = "batch_response_boundary";

/// One sub-request of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPart {
    /// `Content-ID` of the part, without angle brackets
    pub content_id: Option<String>,
    /// The embedded request
    pub request: HttpRequest,
}

/// One sub-response of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResponsePart {
    /// `Content-ID` of the part, without angle brackets
    pub content_id: Option<String>,
    /// The embedded response
    pub response: HttpResponse,
}

/// Errors while reading a batch envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// The content type is not `multipart/mixed`.
    #[error("not a multipart/mixed message")]
    NotMultipart,

    /// The content type carries no boundary.
    #[error("multipart message has no boundary")]
    MissingBoundary,

    /// A part could not be read.
    #[error("malformed batch part: {0}")]
    Malformed(String),
}

/// Returns true if the request is a multipart batch.
pub fn is_batch(request: &HttpRequest) -> bool {
    request
        .header("content-type")
        .is_some_and(|ct| ct.trim().to_ascii_lowercase().starts_with("multipart/mixed"))
}

/// Extracts the `boundary` parameter of a content type.
pub fn boundary(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

/// Splits a batch request into its sub-requests, in emission order.
pub fn parse_request(request: &HttpRequest) -> Result<Vec<BatchPart>, BatchError> {
    let content_type = request.header("content-type").ok_or(BatchError::NotMultipart)?;
    if !is_batch(request) {
        return Err(BatchError::NotMultipart);
    }
    let boundary = boundary(content_type).ok_or(BatchError::MissingBoundary)?;

    split_parts(&request.body, &boundary)?
        .into_iter()
        .map(|(content_id, inner)| {
            let (head, body) = split_head(inner);
            let mut lines = head.lines();
            let request_line = lines
                .next()
                .ok_or_else(|| BatchError::Malformed("missing request line".to_string()))?;
            let mut words = request_line.split_whitespace();
            let (Some(method), Some(uri)) = (words.next(), words.next()) else {
                return Err(BatchError::Malformed(format!("bad request line '{}'", request_line)));
            };
            let mut sub = HttpRequest::new(method, uri).with_body(body.to_vec());
            sub.headers = parse_headers(lines);
            Ok(BatchPart {
                content_id,
                request: sub,
            })
        })
        .collect()
}

/// Splits a batch response into its sub-responses.
pub fn parse_response(response: &HttpResponse) -> Result<Vec<BatchResponsePart>, BatchError> {
    let content_type = response.header("content-type").ok_or(BatchError::NotMultipart)?;
    let boundary = boundary(content_type).ok_or(BatchError::MissingBoundary)?;

    split_parts(&response.body, &boundary)?
        .into_iter()
        .map(|(content_id, inner)| {
            let (head, body) = split_head(inner);
            let mut lines = head.lines();
            let status_line = lines
                .next()
                .ok_or_else(|| BatchError::Malformed("missing status line".to_string()))?;
            let status = status_line
                .split_whitespace()
                .nth(1)
                .and_then(|s| s.parse::<u16>().ok())
                .ok_or_else(|| BatchError::Malformed(format!("bad status line '{}'", status_line)))?;
            let mut sub = HttpResponse::new(status, body.to_vec());
            sub.headers = parse_headers(lines);
            Ok(BatchResponsePart {
                content_id: content_id.map(|id| id.strip_prefix("response-").unwrap_or(&id).to_string()),
                response: sub,
            })
        })
        .collect()
}

/// Builds a batch request to `uri` from sub-requests.
pub fn encode_request(uri: &str, boundary: &str, parts: &[BatchPart]) -> HttpRequest {
    let mut body = Vec::new();
    for part in parts {
        let mut head = format!("--{}\r\n", boundary);
        head.push_str("Content-Type: application/http\r\n");
        head.push_str("Content-Transfer-Encoding: binary\r\n");
        if let Some(id) = &part.content_id {
            head.push_str(&format!("Content-ID: <{}>\r\n", id));
        }
        head.push_str("\r\n");
        head.push_str(&format!("{} {} HTTP/1.1\r\n", part.request.method, part.request.uri));
        for (name, value) in &part.request.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");
        body.extend_from_slice(head.as_bytes());
        body.extend_from_slice(&part.request.body);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

    HttpRequest::new("POST", uri)
        .with_header("content-type", format!("multipart/mixed; boundary={}", boundary))
        .with_body(body)
}

/// Builds the multipart reply for a batch. Each part answers the request with
/// the same `Content-ID` as `<response-ID>`.
pub fn encode_response(parts: &[BatchResponsePart]) -> HttpResponse {
    let mut body = Vec::new();
    for part in parts {
        let mut head = format!("--{}\r\n", RESPONSE_BOUNDARY);
        head.push_str("Content-Type: application/http\r\n");
        if let Some(id) = &part.content_id {
            head.push_str(&format!("Content-ID: <response-{}>\r\n", id));
        }
        head.push_str("\r\n");
        let status = part.response.status;
        head.push_str(&format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status)).replace(" \r\n", "\r\n"));
        for (name, value) in &part.response.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");
        body.extend_from_slice(head.as_bytes());
        body.extend_from_slice(&part.response.body);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", RESPONSE_BOUNDARY).as_bytes());

    HttpResponse::new(200, body).with_header("content-type", format!("multipart/mixed; boundary={}", RESPONSE_BOUNDARY))
}

// Returns (content id, bytes after the part's own headers) per part.
fn split_parts<'b>(body: &'b [u8], boundary: &str) -> Result<Vec<(Option<String>, &'b [u8])>, BatchError> {
    let delimiter = format!("--{}", boundary);
    let mut parts = Vec::new();
    let mut chunks = split_on(body, delimiter.as_bytes()).into_iter();
    chunks.next();
    for chunk in chunks {
        if chunk.starts_with(b"--") {
            break;
        }
        let chunk = chunk.strip_prefix(b"\r\n").or_else(|| chunk.strip_prefix(b"\n")).unwrap_or(chunk);
        let chunk = chunk.strip_suffix(b"\r\n").or_else(|| chunk.strip_suffix(b"\n")).unwrap_or(chunk);
        let (outer, inner) = split_head(chunk);
        if inner.is_empty() && outer.trim().is_empty() {
            return Err(BatchError::Malformed("empty part".to_string()));
        }
        let content_id = parse_headers(outer.lines())
            .into_iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-id"))
            .map(|(_, v)| v.trim_start_matches('<').trim_end_matches('>').to_string());
        parts.push((content_id, inner));
    }
    Ok(parts)
}

fn split_on<'b>(bytes: &'b [u8], delimiter: &[u8]) -> Vec<&'b [u8]> {
    let mut pieces = Vec::new();
    let mut rest = bytes;
    while let Some(at) = find(rest, delimiter) {
        pieces.push(&rest[..at]);
        rest = &rest[at + delimiter.len()..];
    }
    pieces.push(rest);
    pieces
}

fn find(bytes: &[u8], needle: &[u8]) -> Option<usize> {
    bytes.windows(needle.len()).position(|window| window == needle)
}

// Headers are text; whatever follows the blank line is kept as raw bytes.
fn split_head(bytes: &[u8]) -> (String, &[u8]) {
    let crlf = find(bytes, b"\r\n\r\n").map(|i| (i, 4));
    let lf = find(bytes, b"\n\n").map(|i| (i, 2));
    let split = match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    };
    match split {
        Some((at, len)) => (String::from_utf8_lossy(&bytes[..at]).into_owned(), &bytes[at + len..]),
        None => (String::from_utf8_lossy(bytes).into_owned(), &bytes[..0]),
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<(String, String)> {
    lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}
