//! Minimal HTTP/1.1 plumbing for the control listener
//!
//! Only what one request per connection needs: locating and parsing the
//! request head, replaying body bytes that arrived together with the head,
//! and writing a `Connection: close` response.

use core::fmt::Write as _;
use core::num::IntErrorKind;

use embedded_io_async::{ErrorType, Read, Write};
use heapless::String as HString;
use log::error;
use thiserror_no_std::Error;

/// Size of the buffer the request head must fit in
pub const MAX_HEAD_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Other,
}

impl Method {
    fn parse(token: &str) -> Self {
        match token {
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "OPTIONS" => Self::Options,
            _ => Self::Other,
        }
    }
}

/// Parsed request line and the headers the listener cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHead<'a> {
    pub method: Method,
    /// Path without the query string
    pub path: &'a str,
    /// Raw `Content-Length`; kept signed so a negative declaration can be
    /// rejected by the decoder rather than by the parser.
    pub content_length: Option<i64>,
}

impl RequestHead<'_> {
    /// Body length the client declared, zero when absent.
    pub fn declared_len(&self) -> i64 {
        self.content_length.unwrap_or(0)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadError {
    #[error("request head is not valid HTTP/1.x")]
    Malformed,
    #[error("Content-Length is not a number")]
    BadContentLength,
    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),
}

/// Offset just past the `\r\n\r\n` that ends the head.
pub fn find_head_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Decimal lengths beyond `i64` saturate so they are rejected as too large
/// rather than as unparseable.
fn parse_content_length(value: &str) -> Result<i64, HeadError> {
    match value.parse::<i64>() {
        Ok(len) => Ok(len),
        Err(e) => match e.kind() {
            IntErrorKind::PosOverflow => Ok(i64::MAX),
            IntErrorKind::NegOverflow => Ok(i64::MIN),
            _ => Err(HeadError::BadContentLength),
        },
    }
}

pub fn parse_head(head: &[u8]) -> Result<RequestHead<'_>, HeadError> {
    let text = core::str::from_utf8(head).map_err(|_| HeadError::Malformed)?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().ok_or(HeadError::Malformed)?;
    let mut parts = request_line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(HeadError::Malformed);
    };
    if !version.starts_with("HTTP/1.") || !target.starts_with('/') {
        return Err(HeadError::Malformed);
    }
    let path = target.split_once('?').map_or(target, |(path, _)| path);

    let mut content_length = None;
    for line in lines.take_while(|line| !line.is_empty()) {
        let (name, value) = line.split_once(':').ok_or(HeadError::Malformed)?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            content_length = Some(parse_content_length(value.trim())?);
        }
    }

    Ok(RequestHead {
        method: Method::parse(method),
        path,
        content_length,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    BadRequest,
    NotFound,
    MethodNotAllowed,
    HeaderFieldsTooLarge,
    InternalServerError,
}

impl StatusCode {
    pub const fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::HeaderFieldsTooLarge => 431,
            Self::InternalServerError => 500,
        }
    }

    pub const fn reason_phrase(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::BadRequest => "Bad Request",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::HeaderFieldsTooLarge => "Request Header Fields Too Large",
            Self::InternalServerError => "Internal Server Error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Json,
    Text,
}

impl ContentType {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Text => "text/plain; charset=utf-8",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub content_type: ContentType,
    pub body: &'static str,
    /// Sent as `Allow` on 405 responses
    pub allow: Option<&'static str>,
}

impl Response {
    pub const fn json(status: StatusCode, body: &'static str) -> Self {
        Self {
            status,
            content_type: ContentType::Json,
            body,
            allow: None,
        }
    }

    pub const fn text(status: StatusCode, body: &'static str) -> Self {
        Self {
            status,
            content_type: ContentType::Text,
            body,
            allow: None,
        }
    }
}

/// Sent instead of a response whose head does not fit in [`HEAD_CAPACITY`]
const FALLBACK_HEAD: &str =
    "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

const HEAD_CAPACITY: usize = 256;

fn format_head(response: &Response) -> Result<HString<HEAD_CAPACITY>, core::fmt::Error> {
    let mut head = HString::new();
    write!(
        head,
        "HTTP/1.1 {} {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n",
        response.status.code(),
        response.status.reason_phrase(),
        response.content_type.as_str(),
        response.body.len(),
    )?;
    if let Some(allow) = response.allow {
        write!(head, "Allow: {}\r\n", allow)?;
    }
    head.push_str("\r\n").map_err(|_| core::fmt::Error)?;
    Ok(head)
}

pub async fn write_response<W: Write>(out: &mut W, response: &Response) -> Result<(), W::Error> {
    match format_head(response) {
        Ok(head) => {
            out.write_all(head.as_bytes()).await?;
            out.write_all(response.body.as_bytes()).await?;
        }
        Err(_) => {
            error!(
                "response head for {} exceeds {} bytes",
                response.status.code(),
                HEAD_CAPACITY
            );
            out.write_all(FALLBACK_HEAD.as_bytes()).await?;
        }
    }
    out.flush().await
}

/// Reader that first yields bytes already buffered with the head, then
/// continues with the underlying transport.
pub struct Prefixed<'a, R> {
    prefix: &'a [u8],
    inner: &'a mut R,
}

impl<'a, R> Prefixed<'a, R> {
    pub fn new(prefix: &'a [u8], inner: &'a mut R) -> Self {
        Self { prefix, inner }
    }
}

impl<R: ErrorType> ErrorType for Prefixed<'_, R> {
    type Error = R::Error;
}

impl<R: Read> Read for Prefixed<'_, R> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.prefix.is_empty() {
            return self.inner.read(buf).await;
        }
        let n = self.prefix.len().min(buf.len());
        buf[..n].copy_from_slice(&self.prefix[..n]);
        self.prefix = &self.prefix[n..];
        Ok(n)
    }
}
