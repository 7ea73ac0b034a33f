use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use http::Request as HttpRequest;
use http::{HeaderMap, HeaderValue, Method, Version};

use crate::body::Body;
use crate::{COLON_SPACE, CR_LF, SPACE};

/// A request flowing through the proxy.
///
/// Handlers receive the request by value, may mutate it, and hand it back to
/// the chain; the transport serializes it onto a persistent connection.
#[derive(Default, Clone)]
pub struct Request {
  uri: http::Uri,
  version: Version,
  method: Method,
  headers: HeaderMap<HeaderValue>,
  body: Option<Body>,
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("method", &self.method)
      .field("headers", &self.headers)
      .field("body", &self.body)
      .finish()
  }
}

impl<T> From<HttpRequest<T>> for Request
where
  T: Into<Body>,
{
  fn from(value: HttpRequest<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      uri: parts.uri,
      version: parts.version,
      method: parts.method,
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Request {
  /// Creates a new builder-style object to manufacture a `Request`.
  pub fn builder() -> http::request::Builder {
    http::request::Builder::new()
  }
  /// Serialize in origin-form (`GET /path HTTP/1.1`), the framing used on a
  /// direct connection to the origin server.
  pub(crate) fn to_raw(&self) -> Bytes {
    self.write_request(false)
  }
  /// Serialize in absolute-form (`GET http://host/path HTTP/1.1`), the
  /// framing used on a plaintext connection through an HTTP proxy.
  pub(crate) fn to_raw_proxy(&self) -> Bytes {
    self.write_request(true)
  }
  fn write_request(&self, absolute_form: bool) -> Bytes {
    let mut http_requests = Vec::new();
    http_requests.extend(self.method.as_str().as_bytes());
    http_requests.extend(SPACE);
    if absolute_form {
      http_requests.extend(self.uri.to_string().as_bytes());
    } else {
      http_requests.extend(self.uri.path().as_bytes());
      if let Some(q) = self.uri.query() {
        http_requests.extend([63]);
        http_requests.extend(q.as_bytes());
      }
    }
    http_requests.extend(SPACE);
    http_requests.extend(format!("{:?}", self.version).as_bytes());
    http_requests.extend(CR_LF);
    // 如果请求头里面没有主机头就先加主机头
    if self.headers.get(http::header::HOST).is_none() {
      http_requests.extend(http::header::HOST.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      http_requests.extend(if let Some(s) = self.uri.authority() {
        s.as_str().as_bytes()
      } else {
        &[]
      });
      http_requests.extend(CR_LF);
    }
    let mut headers = self.headers.clone();
    // bodies are always written whole, so framing is Content-Length only
    headers.remove(http::header::TRANSFER_ENCODING);
    // 如果有body加入Content-Length请求头
    if let Some(b) = self.body() {
      if !b.is_empty() {
        headers
          .entry(http::header::CONTENT_LENGTH)
          .or_insert(HeaderValue::from(b.len()));
      }
    }
    for (k, v) in headers.iter() {
      http_requests.extend(k.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      http_requests.extend(v.as_bytes());
      http_requests.extend(CR_LF);
    }
    http_requests.extend(CR_LF);
    if let Some(b) = self.body() {
      if !b.is_empty() {
        http_requests.extend(b.as_ref());
      }
    }
    Bytes::from(http_requests)
  }
}

impl Request {
  /// Get the HTTP method for this request.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Get a mutable reference to the method.
  #[inline]
  pub fn method_mut(&mut self) -> &mut Method {
    &mut self.method
  }
  /// Get the URI for this request.
  #[inline]
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }
  /// Get a mutable reference to the URI.
  #[inline]
  pub fn uri_mut(&mut self) -> &mut http::Uri {
    &mut self.uri
  }
  /// Get the HTTP version of this request.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// Get a mutable reference to the version.
  #[inline]
  pub fn version_mut(&mut self) -> &mut Version {
    &mut self.version
  }
  /// Get the headers of this request.
  #[inline]
  pub fn headers(&self) -> &HeaderMap<HeaderValue> {
    &self.headers
  }
  /// Get a mutable reference to the headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap<HeaderValue> {
    &mut self.headers
  }
  /// Get the body of this request.
  #[inline]
  pub fn body(&self) -> &Option<Body> {
    &self.body
  }
  /// Get a mutable reference to the body.
  #[inline]
  pub fn body_mut(&mut self) -> &mut Option<Body> {
    &mut self.body
  }
  /// Whether the peer asked for the connection to be torn down after this
  /// message.
  pub(crate) fn wants_close(&self) -> bool {
    wants_close(&self.headers, self.version)
  }
}

/// `Connection: close`, or an HTTP/1.0 message without explicit keep-alive.
pub(crate) fn wants_close(headers: &HeaderMap<HeaderValue>, version: Version) -> bool {
  match headers.get(http::header::CONNECTION) {
    Some(v) => v
      .to_str()
      .map(|v| v.eq_ignore_ascii_case("close"))
      .unwrap_or(false),
    None => version == Version::HTTP_10,
  }
}

/// `host:port` with the port defaulted from the scheme (80 for http, 443 for
/// https).
pub(crate) fn canonical_addr(uri: &http::Uri) -> String {
  let host = uri.host().unwrap_or_default();
  let port = uri.port_u16().unwrap_or_else(|| {
    if uri.scheme_str() == Some("https") {
      443
    } else {
      80
    }
  });
  format!("{}:{}", host, port)
}

/// True when `addr` carries an explicit port, accounting for bracketed IPv6
/// literals.
pub(crate) fn has_port(addr: &str) -> bool {
  let colon = addr.rfind(':').map(|i| i as i64).unwrap_or(-1);
  let bracket = addr.rfind(']').map(|i| i as i64).unwrap_or(-1);
  colon > bracket
}
