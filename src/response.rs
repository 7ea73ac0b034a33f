use std::fmt::Debug;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::body::Body;
use crate::errors::{new_io_error, Error, Result};
use crate::request::Request;
use crate::{CR_LF, SPACE};
use http::{HeaderValue, Method, Response as HttpResponse, StatusCode};

/// `Content-Type` of the canned plain-text responses handlers usually build.
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// A response flowing back through the proxy.
#[derive(Debug, Default, Clone)]
pub struct Response {
  version: http::Version,
  uri: http::Uri,
  status_code: http::StatusCode,
  headers: http::HeaderMap<http::HeaderValue>,
  body: Option<Body>,
}

impl PartialEq for Response {
  fn eq(&self, other: &Self) -> bool {
    self.version == other.version
      && self.status_code == other.status_code
      && self.headers == other.headers
      && self.body.eq(&other.body)
  }
}

impl<T> From<HttpResponse<T>> for Response
where
  T: Into<Body>,
{
  fn from(value: HttpResponse<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      version: parts.version,
      uri: Default::default(),
      status_code: parts.status,
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Response {
  /// An HTTP response builder.
  pub fn builder() -> http::response::Builder {
    http::response::Builder::new()
  }
  /// A canned `text/plain` response, the usual way a request handler
  /// short-circuits the chain.
  ///
  /// ```
  /// use http::StatusCode;
  /// let resp = wiretap::Response::canned(StatusCode::FORBIDDEN, "No Reddit at work time");
  /// assert_eq!(resp.status_code(), StatusCode::FORBIDDEN);
  /// ```
  pub fn canned(status: StatusCode, body: impl Into<Body>) -> Response {
    Self::with_content_type(CONTENT_TYPE_TEXT, status, body)
  }
  /// A canned response with an explicit `Content-Type`.
  pub fn with_content_type(
    content_type: &str,
    status: StatusCode,
    body: impl Into<Body>,
  ) -> Response {
    let body = body.into();
    let mut headers = http::HeaderMap::new();
    if let Ok(v) = HeaderValue::from_str(content_type) {
      headers.insert(http::header::CONTENT_TYPE, v);
    }
    headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    Response {
      version: http::Version::HTTP_11,
      uri: Default::default(),
      status_code: status,
      headers,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Response {
  /// Get the `StatusCode` of this `Response`.
  #[inline]
  pub fn status_code(&self) -> http::StatusCode {
    self.status_code
  }
  /// Get a mutable reference to the status code.
  #[inline]
  pub fn status_code_mut(&mut self) -> &mut http::StatusCode {
    &mut self.status_code
  }
  /// Get the HTTP `Version` of this `Response`.
  #[inline]
  pub fn version(&self) -> http::Version {
    self.version
  }
  /// Get the headers of this `Response`.
  #[inline]
  pub fn headers(&self) -> &http::HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut http::HeaderMap {
    &mut self.headers
  }
  /// Get the content-length of the response, if it is known.
  ///
  /// Reasons it may not be known:
  ///
  /// - The server didn't send a `content-length` header.
  /// - The response was gzipped and transparently decoded by the transport
  ///   (which strips the header because the decoded length differs).
  pub fn content_length(&self) -> Option<u64> {
    self
      .headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.parse().ok())
  }
  /// Get the `http::Uri` this response was fetched from.
  #[inline]
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }
  #[inline]
  pub(crate) fn uri_mut(&mut self) -> &mut http::Uri {
    &mut self.uri
  }
  /// Get the full response body.
  pub fn body(&self) -> &Option<Body> {
    &self.body
  }
  /// Get a mutable reference to the body.
  pub fn body_mut(&mut self) -> &mut Option<Body> {
    &mut self.body
  }
  /// The response text, decoded lossily as UTF-8.
  pub fn text(&self) -> String {
    match self.body() {
      Some(b) => String::from_utf8_lossy(b).to_string(),
      None => String::new(),
    }
  }
  pub(crate) fn wants_close(&self) -> bool {
    crate::request::wants_close(&self.headers, self.version)
  }
}

/// Whether a response to `method` with this status carries a body at all.
pub(crate) fn status_permits_body(method: &Method, status: StatusCode) -> bool {
  if method == Method::HEAD {
    return false;
  }
  !(status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED)
}

/// Parsing configuration carried from the request that elicited the
/// response.
#[derive(Debug, Default, Clone)]
pub struct ResponseConfig {
  method: Method,
}

impl ResponseConfig {
  /// Configuration for parsing the response to `request`.
  pub fn new(request: &Request) -> Self {
    ResponseConfig {
      method: request.method().clone(),
    }
  }
}

/// An incremental HTTP/1.1 response parser over a buffered reader.
///
/// The reader is borrowed, not owned: on a persistent connection the same
/// buffer must survive across responses so pipelined bytes are not lost.
#[derive(Debug)]
pub struct ResponseBuilder<R> {
  builder: http::response::Builder,
  reader: R,
  config: ResponseConfig,
}

impl<R: AsyncBufRead + Unpin> ResponseBuilder<R> {
  /// Constructs a new response parser.
  pub fn new(reader: R, config: ResponseConfig) -> ResponseBuilder<R> {
    ResponseBuilder {
      builder: Default::default(),
      reader,
      config,
    }
  }

  async fn parser_version(&mut self) -> Result<(http::Version, http::StatusCode)> {
    let mut line = Vec::new();
    let length = self.reader.read_until(b'\n', &mut line).await?;
    if length == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "eof reading status line",
      ));
    }
    let line = line.strip_suffix(CR_LF).unwrap_or(&line);
    let mut parts = line.splitn(3, |b| b == &b' ');
    let version = match parts.next() {
      Some(b"HTTP/0.9") => http::Version::HTTP_09,
      Some(b"HTTP/1.0") => http::Version::HTTP_10,
      Some(b"HTTP/1.1") => http::Version::HTTP_11,
      _ => {
        return Err(new_io_error(
          std::io::ErrorKind::InvalidData,
          "invalid http version",
        ));
      }
    };
    let status = parts
      .next()
      .ok_or_else(|| new_io_error(std::io::ErrorKind::InvalidData, "missing status code"))
      .and_then(|vc| {
        http::StatusCode::try_from(vc).map_err(|x| Error::Http(http::Error::from(x)))
      })?;
    Ok((version, status))
  }

  async fn read_headers(&mut self) -> Result<http::HeaderMap> {
    read_header_block(&mut self.reader).await
  }

  async fn read_body(&mut self, header: &http::HeaderMap) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    if matches!(self.config.method, Method::HEAD) {
      return Ok(body);
    }
    let content_length: Option<u64> = header
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.parse().ok());
    if is_chunked(header) {
      body = read_chunked_body(&mut self.reader).await?;
    } else if let Some(length) = content_length {
      if length > 0 {
        body = vec![0; length as usize];
        self.reader.read_exact(&mut body).await?;
      }
    } else {
      // body delimited by connection close
      self.reader.read_to_end(&mut body).await?;
    }
    Ok(body)
  }

  /// Parse one `Response` off the reader.
  pub async fn build(mut self) -> Result<Response> {
    let (v, c) = self.parser_version().await?;
    self.builder = self.builder.version(v).status(c);
    let header = self.read_headers().await?;
    let body = if status_permits_body(&self.config.method, c) {
      self.read_body(&header).await?
    } else {
      Vec::new()
    };
    if let Some(h) = self.builder.headers_mut() {
      *h = header;
    }
    let resp = self.builder.body(body)?;
    Ok(resp.into())
  }
}

const MAX_REQUEST_LINE: usize = 8 * 1024;
const MAX_HEADER_BLOCK: usize = 64 * 1024;

/// An incremental HTTP/1.1 request parser, used for the inbound client
/// connection and for requests read off a MITM'd TLS stream.
#[derive(Debug)]
pub struct RequestReader<R> {
  reader: R,
}

impl<R: AsyncBufRead + Unpin> RequestReader<R> {
  /// Constructs a new request parser over `reader`.
  pub fn new(reader: R) -> RequestReader<R> {
    RequestReader { reader }
  }

  /// Peek for end-of-stream without consuming anything.
  pub async fn at_eof(&mut self) -> bool {
    matches!(self.reader.fill_buf().await, Ok(buf) if buf.is_empty())
  }

  /// Give back the underlying reader, e.g. to hijack the connection after
  /// a `CONNECT` head.
  pub fn into_inner(self) -> R {
    self.reader
  }

  /// Parse one request off the reader.
  ///
  /// Accepts all three HTTP/1.1 request-target forms: absolute
  /// (`GET http://h/p`), origin (`GET /p`), and authority (`CONNECT h:p`).
  pub async fn read_request(&mut self) -> Result<Request> {
    let mut line = Vec::new();
    let length = self.reader.read_until(b'\n', &mut line).await?;
    if length == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "eof reading request line",
      ));
    }
    if length > MAX_REQUEST_LINE {
      return Err(Error::InvalidRequest("request line too long".to_string()));
    }
    let line = line.strip_suffix(CR_LF).unwrap_or(&line);
    let text = String::from_utf8_lossy(line);
    let mut parts = text.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
      (Some(m), Some(t), Some(v)) => (m, t, v),
      _ => return Err(Error::InvalidRequest(format!("invalid request line {text:?}"))),
    };
    let method = Method::from_bytes(method.as_bytes())?;
    let version = match version {
      "HTTP/1.0" => http::Version::HTTP_10,
      "HTTP/1.1" => http::Version::HTTP_11,
      v => return Err(Error::InvalidRequest(format!("unsupported version {v:?}"))),
    };
    let uri = parse_request_target(target)?;
    let mut headers = read_header_block(&mut self.reader).await?;
    let body = self.read_body(&method, &headers).await?;
    // the body is decoded above; serialization reframes with
    // Content-Length only
    headers.remove(http::header::TRANSFER_ENCODING);

    let mut req: Request = Request::default();
    *req.method_mut() = method;
    *req.uri_mut() = uri;
    *req.version_mut() = version;
    *req.headers_mut() = headers;
    *req.body_mut() = if body.is_empty() {
      None
    } else {
      Some(body.into())
    };
    Ok(req)
  }

  async fn read_body(&mut self, method: &Method, headers: &http::HeaderMap) -> Result<Vec<u8>> {
    if method == Method::CONNECT {
      return Ok(Vec::new());
    }
    if is_chunked(headers) {
      return read_chunked_body(&mut self.reader).await;
    }
    let content_length: u64 = headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.parse().ok())
      .unwrap_or(0);
    let mut body = vec![0; content_length as usize];
    self.reader.read_exact(&mut body).await?;
    Ok(body)
  }
}

fn parse_request_target(target: &str) -> Result<http::Uri> {
  if let Ok(uri) = target.parse::<http::Uri>() {
    if uri.host().is_some() || target.starts_with('/') {
      return Ok(uri);
    }
  }
  // authority-form targets the generic parser rejects or mistakes for a scheme
  let mut parts = http::uri::Parts::default();
  parts.authority = Some(target.parse().map_err(http::Error::from)?);
  http::Uri::from_parts(parts).map_err(|e| Error::Http(http::Error::from(e)))
}

async fn read_header_block<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<http::HeaderMap> {
  let mut headers = http::HeaderMap::new();
  let mut header_line = Vec::new();
  let mut total = 0usize;
  loop {
    let length = reader.read_until(b'\n', &mut header_line).await?;
    if length == 0 || header_line == b"\r\n" || header_line == b"\n" {
      break;
    }
    total += length;
    if total > MAX_HEADER_BLOCK {
      return Err(Error::InvalidRequest("header block too large".to_string()));
    }
    if let Ok((Some(k), Some(v))) = parser_headers(&header_line) {
      if headers.contains_key(&k) {
        headers.append(k, v);
      } else {
        headers.insert(k, v);
      }
    }
    header_line.clear();
  }
  Ok(headers)
}

fn is_chunked(headers: &http::HeaderMap) -> bool {
  headers
    .get(http::header::TRANSFER_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.to_ascii_lowercase().contains("chunked"))
    .unwrap_or(false)
}

async fn read_chunked_body<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
  let mut body: Vec<u8> = Vec::new();
  loop {
    let mut size_line = Vec::new();
    if reader.read_until(b'\n', &mut size_line).await? == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "eof reading chunk size",
      ));
    }
    let size_text = String::from_utf8_lossy(&size_line);
    // chunk extensions after ';' are ignored
    let size_text = size_text
      .trim_end()
      .split(';')
      .next()
      .unwrap_or_default()
      .trim();
    let size = usize::from_str_radix(size_text, 16)?;
    if size == 0 {
      // consume the trailing CRLF after the zero chunk
      let mut trailer = Vec::new();
      loop {
        trailer.clear();
        let n = reader.read_until(b'\n', &mut trailer).await?;
        if n == 0 || trailer == b"\r\n" || trailer == b"\n" {
          break;
        }
      }
      break;
    }
    let mut chunk = vec![0; size];
    reader.read_exact(&mut chunk).await?;
    body.append(&mut chunk);
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
  }
  Ok(body)
}

pub(crate) fn parser_headers(
  buffer: &[u8],
) -> Result<(Option<http::HeaderName>, Option<http::HeaderValue>)> {
  let mut k = None;
  let mut v = None;
  let buffer = buffer.strip_suffix(CR_LF).unwrap_or(buffer);
  let buffer = buffer.strip_suffix(b"\n").unwrap_or(buffer);
  for (index, h) in buffer.splitn(2, |s| s == &58).enumerate() {
    let h = h.strip_prefix(SPACE).unwrap_or(h);
    match index {
      0 => match http::HeaderName::from_bytes(h) {
        Ok(hk) => k = Some(hk),
        Err(err) => {
          return Err(Error::Http(http::Error::from(err)));
        }
      },
      1 => match http::HeaderValue::from_bytes(h) {
        Ok(hv) => v = Some(hv),
        Err(err) => {
          return Err(Error::Http(http::Error::from(err)));
        }
      },
      _ => {}
    }
  }
  Ok((k, v))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::request::Request;
  use tokio::io::BufReader;

  fn get_request() -> Request {
    Request::builder()
      .uri("http://example.com/")
      .body(None::<Vec<u8>>)
      .unwrap()
      .into()
  }

  #[tokio::test]
  async fn parses_content_length_body() {
    let raw: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
    let resp = ResponseBuilder::new(
      BufReader::new(raw),
      ResponseConfig::new(&get_request()),
    )
    .build()
    .await
    .unwrap();
    assert_eq!(resp.status_code(), StatusCode::OK);
    assert_eq!(resp.text(), "hello");
  }

  #[tokio::test]
  async fn parses_chunked_body() {
    let raw: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
    let resp = ResponseBuilder::new(
      BufReader::new(raw),
      ResponseConfig::new(&get_request()),
    )
    .build()
    .await
    .unwrap();
    assert_eq!(resp.text(), "hello world");
  }

  #[tokio::test]
  async fn head_response_has_no_body() {
    let head: Request = Request::builder()
      .method(Method::HEAD)
      .uri("http://example.com/")
      .body(None::<Vec<u8>>)
      .unwrap()
      .into();
    let raw: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n";
    let resp = ResponseBuilder::new(BufReader::new(raw), ResponseConfig::new(&head))
      .build()
      .await
      .unwrap();
    assert!(resp.body().is_none());
    assert_eq!(resp.content_length(), Some(5));
  }

  #[tokio::test]
  async fn reads_requests_in_all_target_forms() {
    let raw: &[u8] =
      b"GET http://example.com/abs HTTP/1.1\r\nHost: example.com\r\n\r\nGET /rel HTTP/1.1\r\n\r\nCONNECT example.com:443 HTTP/1.1\r\n\r\n";
    let mut reader = RequestReader::new(BufReader::new(raw));

    let absolute = reader.read_request().await.unwrap();
    assert_eq!(absolute.uri().host(), Some("example.com"));
    assert_eq!(absolute.uri().path(), "/abs");

    let origin = reader.read_request().await.unwrap();
    assert!(origin.uri().host().is_none());
    assert_eq!(origin.uri().path(), "/rel");

    let connect = reader.read_request().await.unwrap();
    assert_eq!(connect.method(), Method::CONNECT);
    assert_eq!(
      connect.uri().authority().map(|a| a.as_str()),
      Some("example.com:443")
    );
    assert!(reader.at_eof().await);
  }

  #[tokio::test]
  async fn reads_request_body_by_content_length() {
    let raw: &[u8] = b"POST /submit HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc";
    let mut reader = RequestReader::new(BufReader::new(raw));
    let req = reader.read_request().await.unwrap();
    assert_eq!(req.body().as_ref().unwrap().as_ref(), b"abc");
  }

  #[tokio::test]
  async fn chunked_request_body_is_decoded_and_reframed() {
    let raw: &[u8] =
      b"POST /submit HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n";
    let mut reader = RequestReader::new(BufReader::new(raw));
    let req = reader.read_request().await.unwrap();
    assert_eq!(req.body().as_ref().unwrap().as_ref(), b"abc");
    // re-serializing must not carry chunked framing next to the computed
    // Content-Length
    assert!(req.headers().get(http::header::TRANSFER_ENCODING).is_none());
    assert!(reader.at_eof().await);
  }
}
