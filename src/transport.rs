//! Keep-alive HTTP transport.
//!
//! Outbound requests are dispatched over persistent connections held in a
//! per-destination idle pool. Each connection has a dedicated reader task
//! that pairs responses with the requests enqueued on an internal channel,
//! so per-connection responses always come back in request order. Gzip
//! decoding is transparent: when the transport added `Accept-Encoding:
//! gzip` itself, a gzipped response body is decoded before delivery and the
//! encoding headers are stripped.

use std::collections::HashMap;
use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use flate2::read::MultiGzDecoder;
use http::{HeaderValue, Method, Uri};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tracing::{debug, warn};

use crate::ca::strip_port;
use crate::connector::{connect_preamble, proxy_auth_from_uri, Connector, NoVerifier};
use crate::errors::{Error, Result};
use crate::request::{canonical_addr, Request};
use crate::response::{Response, ResponseBuilder, ResponseConfig};
use crate::socket::MaybeTlsStream;

/// Idle connections kept per destination when no explicit limit is set.
pub const DEFAULT_MAX_IDLE_CONNS_PER_HOST: usize = 2;

/// Where a round trip actually went.
#[derive(Debug, Clone)]
pub struct RoundTripDetails {
  /// the address the connection was dialed to
  pub host: String,
  /// the resolved remote address
  pub peer_addr: Option<SocketAddr>,
  /// whether an HTTP proxy carried the request
  pub is_proxy: bool,
}

/// Dispatches a request and returns the response.
///
/// Sessions normally dispatch through the proxy's [`Transport`]; handlers
/// can swap in their own implementation per session via
/// [`SessionContext::set_round_tripper`](crate::SessionContext::set_round_tripper).
#[async_trait]
pub trait RoundTripper: Send + Sync {
  /// Execute `req` and return the response.
  async fn round_trip(&self, req: Request) -> Result<Response>;
  /// Execute `req` and additionally report where the connection went.
  async fn detailed_round_trip(&self, req: Request) -> Result<(RoundTripDetails, Response)>;
}

/// Selects the proxy (if any) for a request. See [`proxy_from_environment`].
pub type ProxySelector = dyn Fn(&Request) -> Result<Option<Uri>> + Send + Sync;

/// The keep-alive transport.
pub struct Transport {
  proxy: Option<Arc<ProxySelector>>,
  connector: Connector,
  tls: OnceLock<Arc<ClientConfig>>,
  explicit_tls: Option<Arc<ClientConfig>>,
  root_certs: Vec<CertificateDer<'static>>,
  accept_invalid_certs: bool,
  disable_compression: bool,
  disable_keepalives: bool,
  max_idle_per_host: i32,
  pool: Arc<IdlePool>,
  alt_proto: HashMap<String, Arc<dyn RoundTripper>>,
}

impl Default for Transport {
  fn default() -> Self {
    Self::new()
  }
}

impl Transport {
  /// A transport with default settings: compression and keep-alives on, no
  /// proxy, at most [`DEFAULT_MAX_IDLE_CONNS_PER_HOST`] idle connections
  /// per destination.
  pub fn new() -> Self {
    Self {
      proxy: None,
      connector: Connector::default(),
      tls: OnceLock::new(),
      explicit_tls: None,
      root_certs: Vec::new(),
      accept_invalid_certs: false,
      disable_compression: false,
      disable_keepalives: false,
      max_idle_per_host: 0,
      pool: Arc::new(IdlePool::default()),
      alt_proto: HashMap::new(),
    }
  }
  /// Route requests through the proxy selected by `f` (for example
  /// [`proxy_from_environment`]).
  pub fn with_proxy(
    mut self,
    f: impl Fn(&Request) -> Result<Option<Uri>> + Send + Sync + 'static,
  ) -> Self {
    self.proxy = Some(Arc::new(f));
    self
  }
  /// Route every request through `proxy_uri`.
  pub fn with_fixed_proxy(self, proxy_uri: Uri) -> Self {
    self.with_proxy(move |_| Ok(Some(proxy_uri.clone())))
  }
  /// Replace the dialer.
  pub fn with_connector(mut self, connector: Connector) -> Self {
    self.connector = connector;
    self
  }
  /// Use an explicit rustls client configuration for outbound TLS.
  pub fn with_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
    self.explicit_tls = Some(config);
    self
  }
  /// Trust an additional root certificate for outbound TLS.
  pub fn with_root_certificate(mut self, cert: CertificateDer<'static>) -> Self {
    self.root_certs.push(cert);
    self
  }
  /// Skip verification of upstream certificates entirely.
  pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
    self.accept_invalid_certs = accept;
    self
  }
  /// Stop injecting `Accept-Encoding: gzip` and decoding gzip bodies.
  pub fn disable_compression(mut self, disable: bool) -> Self {
    self.disable_compression = disable;
    self
  }
  /// Close connections after each request instead of pooling them.
  pub fn disable_keepalives(mut self, disable: bool) -> Self {
    self.disable_keepalives = disable;
    self
  }
  /// Idle connections kept per destination. `0` means the default of
  /// [`DEFAULT_MAX_IDLE_CONNS_PER_HOST`]; negative disables pooling.
  pub fn max_idle_per_host(mut self, max: i32) -> Self {
    self.max_idle_per_host = max;
    self
  }
  /// Register a round-tripper for a non-http(s) URL scheme.
  pub fn with_protocol(mut self, scheme: &str, rt: Arc<dyn RoundTripper>) -> Self {
    self.alt_proto.insert(scheme.to_string(), rt);
    self
  }

  fn client_config(&self) -> Arc<ClientConfig> {
    if let Some(config) = &self.explicit_tls {
      return config.clone();
    }
    self
      .tls
      .get_or_init(|| {
        let provider = rustls::crypto::CryptoProvider::get_default()
          .cloned()
          .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
        let builder = ClientConfig::builder_with_provider(provider)
          .with_safe_default_protocol_versions()
          .expect("default protocol versions are supported");
        let config = if self.accept_invalid_certs {
          builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
        } else {
          let mut roots = RootCertStore::empty();
          for cert in &self.root_certs {
            let _ = roots.add(cert.clone());
          }
          builder.with_root_certificates(roots).with_no_client_auth()
        };
        Arc::new(config)
      })
      .clone()
  }

  async fn get_conn(&self, cm: &ConnectMethod) -> Result<Arc<PersistConn>> {
    if let Some(pc) = self.pool.get(&cm.key()) {
      debug!(key = %cm.key(), "reusing idle connection");
      return Ok(pc);
    }
    let addr = cm.addr();
    let stream = match self.connector.dial(&addr).await {
      Ok(stream) => stream,
      Err(Error::Dial { addr, source }) if cm.proxy.is_some() => {
        return Err(Error::Dial {
          addr: format!("proxy {}", addr),
          source,
        });
      }
      Err(e) => return Err(e),
    };
    let peer_addr = stream.peer_addr().ok();

    let mut stream = stream;
    let mut is_proxy = false;
    let mut proxy_auth = None;
    match (&cm.proxy, cm.target_scheme.as_str()) {
      (None, _) => {}
      (Some(_), "http") => {
        // plaintext via proxy: requests are written in absolute form with
        // credentials attached per request
        is_proxy = true;
        proxy_auth = cm.proxy_auth();
      }
      (Some(_), _) => {
        connect_preamble(&mut stream, &cm.target_addr, cm.proxy_auth().as_ref()).await?;
      }
    }

    let stream: MaybeTlsStream = if cm.target_scheme == "https" {
      self
        .connector
        .upgrade_to_tls(stream, self.client_config(), cm.tls_host())
        .await?
        .into()
    } else {
      stream.into()
    };

    let (rd, wr) = tokio::io::split(stream);
    let (reqch_tx, reqch_rx) = mpsc::channel(50);
    let conn = Arc::new(PersistConn {
      cache_key: cm.key(),
      host: addr,
      peer_addr,
      is_proxy,
      proxy_auth,
      writer: tokio::sync::Mutex::new(wr),
      reqch: reqch_tx,
      state: Mutex::new(ConnState {
        broken: false,
        num_expected_responses: 0,
      }),
    });
    let policy = PoolPolicy {
      disable_keepalives: self.disable_keepalives,
      max_idle_per_host: self.max_idle_per_host,
    };
    tokio::spawn(read_loop(
      conn.clone(),
      BufReader::new(rd),
      reqch_rx,
      self.pool.clone(),
      policy,
      self.connector.read_timeout,
    ));
    Ok(conn)
  }

  async fn do_round_trip(&self, mut req: Request) -> Result<(RoundTripDetails, Response)> {
    if req.uri().host().is_none() {
      return Err(Error::InvalidRequest(
        "request URL is not absolute".to_string(),
      ));
    }
    let scheme = req.uri().scheme_str().unwrap_or_default().to_string();
    if scheme != "http" && scheme != "https" {
      if let Some(rt) = self.alt_proto.get(&scheme) {
        return rt.detailed_round_trip(req).await;
      }
      return Err(Error::UnsupportedProtocol(scheme));
    }

    let cm = ConnectMethod::for_request(self.proxy.as_deref(), &req)?;
    let conn = self.get_conn(&cm).await?;

    let mut added_gzip = false;
    if !self.disable_compression
      && req.headers().get(http::header::ACCEPT_ENCODING).is_none()
      && req.method() != Method::HEAD
    {
      added_gzip = true;
      req
        .headers_mut()
        .insert(http::header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
    }
    if conn.is_proxy {
      if let Some(auth) = &conn.proxy_auth {
        req
          .headers_mut()
          .insert(http::header::PROXY_AUTHORIZATION, auth.clone());
      }
    }

    conn.add_expected_response();

    let raw = if conn.is_proxy {
      req.to_raw_proxy()
    } else {
      req.to_raw()
    };
    // enqueue before writing so the reader always has a request to pair
    // with whatever arrives on the wire
    let (reply_tx, reply_rx) = oneshot::channel();
    if conn
      .reqch
      .send(RequestAndReply {
        req,
        reply: reply_tx,
        added_gzip,
      })
      .await
      .is_err()
    {
      conn.mark_broken();
      conn.remove_expected_response();
      return Err(Error::UpstreamRead("connection reader exited".to_string()));
    }

    let write_result = {
      let mut writer = conn.writer.lock().await;
      match writer.write_all(&raw).await {
        Ok(()) => writer.flush().await,
        Err(e) => Err(e),
      }
    };
    if let Err(e) = write_result {
      conn.mark_broken();
      conn.remove_expected_response();
      return Err(Error::Io(e));
    }

    let reply = reply_rx.await;
    conn.remove_expected_response();
    let resp = match reply {
      Ok(result) => result?,
      Err(_) => {
        conn.mark_broken();
        return Err(Error::UpstreamRead(
          "connection closed before response".to_string(),
        ));
      }
    };
    Ok((
      RoundTripDetails {
        host: conn.host.clone(),
        peer_addr: conn.peer_addr,
        is_proxy: conn.is_proxy,
      },
      resp,
    ))
  }
}

#[async_trait]
impl RoundTripper for Transport {
  async fn round_trip(&self, req: Request) -> Result<Response> {
    self.do_round_trip(req).await.map(|(_, resp)| resp)
  }
  async fn detailed_round_trip(&self, req: Request) -> Result<(RoundTripDetails, Response)> {
    self.do_round_trip(req).await
  }
}

/// A `(proxy, scheme, host:port)` triple uniquely determining how a request
/// is delivered, and therefore which pooled connections are interchangeable.
struct ConnectMethod {
  proxy: Option<Uri>,
  target_scheme: String,
  target_addr: String,
}

impl ConnectMethod {
  fn for_request(proxy: Option<&ProxySelector>, req: &Request) -> Result<Self> {
    let target_scheme = req.uri().scheme_str().unwrap_or("http").to_string();
    let target_addr = canonical_addr(req.uri());
    let proxy = match proxy {
      Some(f) => f(req)?,
      None => None,
    };
    Ok(Self {
      proxy,
      target_scheme,
      target_addr,
    })
  }
  /// `proxy|scheme|addr`; `|` cannot appear in any field, so keys never
  /// collide.
  fn key(&self) -> String {
    format!(
      "{}|{}|{}",
      self
        .proxy
        .as_ref()
        .map(|u| u.to_string())
        .unwrap_or_default(),
      self.target_scheme,
      self.target_addr
    )
  }
  /// The address to dial: the proxy when one is configured, the target
  /// otherwise.
  fn addr(&self) -> String {
    match &self.proxy {
      Some(proxy) => canonical_addr(proxy),
      None => self.target_addr.clone(),
    }
  }
  fn tls_host(&self) -> &str {
    strip_port(&self.target_addr)
  }
  fn proxy_auth(&self) -> Option<HeaderValue> {
    self.proxy.as_ref().and_then(proxy_auth_from_uri)
  }
}

#[derive(Clone, Copy)]
struct PoolPolicy {
  disable_keepalives: bool,
  max_idle_per_host: i32,
}

#[derive(Default)]
struct IdlePool {
  inner: Mutex<HashMap<String, Vec<Arc<PersistConn>>>>,
}

impl IdlePool {
  /// Pop the most recently returned viable connection for `key`.
  fn get(&self, key: &str) -> Option<Arc<PersistConn>> {
    let mut inner = self.inner.lock().unwrap();
    let mut result = None;
    let mut emptied = false;
    if let Some(conns) = inner.get_mut(key) {
      while let Some(conn) = conns.pop() {
        if !conn.is_broken() {
          result = Some(conn);
          break;
        }
      }
      emptied = conns.is_empty();
    }
    if emptied {
      inner.remove(key);
    }
    result
  }
  /// Return a connection to the pool; `false` means it was not accepted
  /// and must not be reused.
  fn put(&self, conn: &Arc<PersistConn>, policy: &PoolPolicy) -> bool {
    if policy.disable_keepalives || policy.max_idle_per_host < 0 {
      conn.mark_broken();
      return false;
    }
    if conn.is_broken() {
      return false;
    }
    let max = if policy.max_idle_per_host == 0 {
      DEFAULT_MAX_IDLE_CONNS_PER_HOST
    } else {
      policy.max_idle_per_host as usize
    };
    let mut inner = self.inner.lock().unwrap();
    let conns = inner.entry(conn.cache_key.clone()).or_default();
    if conns.len() >= max {
      conn.mark_broken();
      return false;
    }
    conns.push(conn.clone());
    true
  }
}

struct ConnState {
  broken: bool,
  num_expected_responses: usize,
}

struct RequestAndReply {
  req: Request,
  reply: oneshot::Sender<Result<Response>>,
  added_gzip: bool,
}

pub(crate) struct PersistConn {
  cache_key: String,
  host: String,
  peer_addr: Option<SocketAddr>,
  is_proxy: bool,
  proxy_auth: Option<HeaderValue>,
  writer: tokio::sync::Mutex<WriteHalf<MaybeTlsStream>>,
  reqch: mpsc::Sender<RequestAndReply>,
  state: Mutex<ConnState>,
}

impl PersistConn {
  fn is_broken(&self) -> bool {
    self.state.lock().unwrap().broken
  }
  fn mark_broken(&self) {
    self.state.lock().unwrap().broken = true;
  }
  fn add_expected_response(&self) {
    self.state.lock().unwrap().num_expected_responses += 1;
  }
  fn remove_expected_response(&self) {
    let mut state = self.state.lock().unwrap();
    state.num_expected_responses = state.num_expected_responses.saturating_sub(1);
  }
  fn expected_responses(&self) -> usize {
    self.state.lock().unwrap().num_expected_responses
  }
  async fn close(&self) {
    self.mark_broken();
    let mut writer = self.writer.lock().await;
    let _ = writer.shutdown().await;
  }
}

/// The dedicated reader task of a persistent connection.
///
/// Owns the buffered read side. Blocks peeking for the next byte, matches
/// it to the request at the head of the channel, parses one response,
/// applies gzip transparency, returns the connection to the idle pool when
/// it stays viable, and delivers the result to the waiting caller.
async fn read_loop(
  conn: Arc<PersistConn>,
  mut reader: BufReader<ReadHalf<MaybeTlsStream>>,
  mut reqch: mpsc::Receiver<RequestAndReply>,
  pool: Arc<IdlePool>,
  policy: PoolPolicy,
  read_timeout: Option<std::time::Duration>,
) {
  loop {
    let peeked_nonempty = match reader.fill_buf().await {
      Ok(buf) => !buf.is_empty(),
      Err(_) => false,
    };
    if conn.expected_responses() == 0 {
      conn.close().await;
      if peeked_nonempty {
        warn!(host = %conn.host, "unsolicited response received on idle HTTP connection");
      }
      return;
    }

    let rc = match reqch.recv().await {
      Some(rc) => rc,
      None => {
        conn.close().await;
        return;
      }
    };

    let parse = ResponseBuilder::new(&mut reader, ResponseConfig::new(&rc.req));
    let parsed = match read_timeout {
      None => parse.build().await,
      Some(timeout) => match tokio::time::timeout(timeout, parse.build()).await {
        Ok(result) => result,
        Err(elapsed) => Err(Error::UpstreamRead(elapsed.to_string())),
      },
    };

    let mut alive = true;
    let delivered: Result<Response> = match parsed {
      Err(e) => {
        alive = false;
        Err(Error::UpstreamRead(e.to_string()))
      }
      Ok(mut resp) => {
        *resp.uri_mut() = rc.req.uri().clone();
        // a body delimited by connection close exhausts the stream
        let close_delimited = crate::response::status_permits_body(
          rc.req.method(),
          resp.status_code(),
        ) && resp.content_length().is_none()
          && resp.headers().get(http::header::TRANSFER_ENCODING).is_none();
        let gzip_result = maybe_decode_gzip(&rc, &mut resp);
        match gzip_result {
          Err(e) => {
            alive = false;
            Err(e)
          }
          Ok(()) => {
            if close_delimited || resp.wants_close() || rc.req.wants_close() {
              alive = false;
            }
            if alive && !pool.put(&conn, &policy) {
              alive = false;
            }
            Ok(resp)
          }
        }
      }
    };
    let _ = rc.reply.send(delivered);
    if !alive {
      conn.close().await;
      return;
    }
  }
}

/// Transparently decode a gzip body the transport itself asked for,
/// stripping the headers the decode invalidates.
fn maybe_decode_gzip(rc: &RequestAndReply, resp: &mut Response) -> Result<()> {
  let has_body = rc.req.method() != Method::HEAD && resp.body().is_some();
  let is_gzip = resp
    .headers()
    .get(http::header::CONTENT_ENCODING)
    .map(|v| v.as_bytes().eq_ignore_ascii_case(b"gzip"))
    .unwrap_or(false);
  if !(rc.added_gzip && has_body && is_gzip) {
    return Ok(());
  }
  let body = resp.body().clone().unwrap_or_default();
  let mut decoded = Vec::new();
  MultiGzDecoder::new(body.as_ref())
    .read_to_end(&mut decoded)
    .map_err(|e| Error::UpstreamRead(format!("invalid gzip body: {}", e)))?;
  resp.headers_mut().remove(http::header::CONTENT_ENCODING);
  resp.headers_mut().remove(http::header::CONTENT_LENGTH);
  *resp.body_mut() = Some(decoded.into());
  Ok(())
}

fn getenv_either_case(k: &str) -> String {
  std::env::var(k.to_uppercase())
    .or_else(|_| std::env::var(k.to_lowercase()))
    .unwrap_or_default()
}

/// Select the proxy for `req` from `HTTP_PROXY`/`http_proxy`, honoring
/// `NO_PROXY`/`no_proxy` exclusion rules: `*` disables proxying entirely,
/// `.suffix` entries match both the suffix and the bare domain, and
/// localhost and loopback addresses are never proxied.
pub fn proxy_from_environment(req: &Request) -> Result<Option<Uri>> {
  let proxy = getenv_either_case("HTTP_PROXY");
  if proxy.is_empty() {
    return Ok(None);
  }
  if !use_proxy(&canonical_addr(req.uri()), &getenv_either_case("NO_PROXY")) {
    return Ok(None);
  }
  match proxy.parse::<Uri>() {
    Ok(uri) if uri.scheme_str().is_some() => Ok(Some(uri)),
    _ => format!("http://{}", proxy)
      .parse::<Uri>()
      .map(Some)
      .map_err(|e| Error::Other(format!("invalid proxy address {:?}: {}", proxy, e))),
  }
}

/// The `NO_PROXY` decision for a canonical `host:port` address.
fn use_proxy(addr: &str, no_proxy: &str) -> bool {
  if addr.is_empty() {
    return true;
  }
  let host = strip_port(addr);
  if host == "localhost" {
    return false;
  }
  if let Ok(ip) = host.parse::<IpAddr>() {
    if ip.is_loopback() {
      return false;
    }
  }
  if no_proxy == "*" {
    return false;
  }
  let addr = strip_port(addr.trim()).to_lowercase();
  for entry in no_proxy.split(',') {
    let entry = entry.trim().to_lowercase();
    if entry.is_empty() {
      continue;
    }
    let entry = strip_port(&entry);
    if addr == entry
      || (entry.starts_with('.') && (addr.ends_with(entry) || addr == entry[1..]))
    {
      return false;
    }
  }
  true
}
