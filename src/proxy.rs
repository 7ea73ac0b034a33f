//! The proxy server: request dispatcher and CONNECT/MITM engine.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderValue, Method, StatusCode, Uri};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::{ClientConfig, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, warn};

use crate::ca::{server_config, strip_port, CertStore, CertificateAuthority, MokaCertStore};
use crate::connector::{connect_preamble, proxy_auth_from_uri, Connector};
use crate::ctx::SessionContext;
use crate::errors::{Error, Result};
use crate::handlers::{
  ConnectAction, ConnectHandler, ConnectKind, RequestHandler, RequestHandlerBuilder,
  ResponseHandler, ResponseHandlerBuilder,
};
use crate::request::{canonical_addr, has_port, Request};
use crate::response::{status_permits_body, RequestReader, Response};
use crate::socket::{Rewind, TunnelStream};
use crate::transport::{RoundTripper, Transport};

/// Dials the upstream side of an accepted `CONNECT` tunnel. Install one on
/// the server to chain tunnels through another proxy; see
/// [`connect_dial_to_proxy`].
#[async_trait]
pub trait ConnectDial: Send + Sync {
  /// Open a tunnel transport to `addr` (`host:port`).
  async fn dial(&self, addr: &str) -> Result<Box<dyn TunnelStream>>;
}

/// Like [`ConnectDial`], but also sees the `CONNECT` request that asked for
/// the tunnel. Takes precedence over `ConnectDial` when both are set.
#[async_trait]
pub trait ConnectDialWithReq: Send + Sync {
  /// Open a tunnel transport to `addr` for `req`.
  async fn dial(&self, req: &Request, addr: &str) -> Result<Box<dyn TunnelStream>>;
}

/// The intercepting forward proxy.
///
/// Register handlers with [`on_request`](Self::on_request) and
/// [`on_response`](Self::on_response), then start serving with
/// [`run`](Self::run) or [`serve`](Self::serve). Registration is
/// configuration-time only: once serving begins the handler lists are
/// frozen inside an `Arc`.
pub struct ProxyServer {
  sess: AtomicI64,
  keep_destination_headers: bool,
  ca: Arc<CertificateAuthority>,
  cert_store: Arc<dyn CertStore>,
  transport: Arc<Transport>,
  connector: Connector,
  connect_dial: Option<Arc<dyn ConnectDial>>,
  connect_dial_with_req: Option<Arc<dyn ConnectDialWithReq>>,
  pub(crate) req_handlers: Vec<Arc<dyn RequestHandler>>,
  pub(crate) resp_handlers: Vec<Arc<dyn ResponseHandler>>,
  pub(crate) connect_handlers: Vec<Arc<dyn ConnectHandler>>,
}

impl ProxyServer {
  /// A proxy minting MITM certificates from `ca`, with a default transport
  /// and an in-memory certificate cache.
  pub fn new(ca: CertificateAuthority) -> Self {
    Self {
      sess: AtomicI64::new(0),
      keep_destination_headers: false,
      ca: Arc::new(ca),
      cert_store: Arc::new(MokaCertStore::default()),
      transport: Arc::new(Transport::new()),
      connector: Connector::default(),
      connect_dial: None,
      connect_dial_with_req: None,
      req_handlers: Vec::new(),
      resp_handlers: Vec::new(),
      connect_handlers: Vec::new(),
    }
  }

  /// Begin registering a request (or CONNECT) handler.
  pub fn on_request(&mut self) -> RequestHandlerBuilder<'_> {
    RequestHandlerBuilder {
      proxy: self,
      conds: Vec::new(),
    }
  }
  /// Begin registering a response handler.
  pub fn on_response(&mut self) -> ResponseHandlerBuilder<'_> {
    ResponseHandlerBuilder {
      proxy: self,
      req_conds: Vec::new(),
      resp_conds: Vec::new(),
    }
  }
  /// When merging a response's headers into the reply, keep headers already
  /// present on the destination instead of clearing them first. Off by
  /// default.
  pub fn set_keep_destination_headers(&mut self, keep: bool) {
    self.keep_destination_headers = keep;
  }
  /// Replace the outbound transport.
  pub fn set_transport(&mut self, transport: Arc<Transport>) {
    self.transport = transport;
  }
  /// Replace the certificate store consulted when MITM'ing.
  pub fn set_cert_store(&mut self, store: Arc<dyn CertStore>) {
    self.cert_store = store;
  }
  /// Install a dialer for accepted `CONNECT` tunnels.
  pub fn set_connect_dial(&mut self, dial: impl ConnectDial + 'static) {
    self.connect_dial = Some(Arc::new(dial));
  }
  /// Install a request-aware dialer for accepted `CONNECT` tunnels.
  pub fn set_connect_dial_with_req(&mut self, dial: impl ConnectDialWithReq + 'static) {
    self.connect_dial_with_req = Some(Arc::new(dial));
  }
  /// The CA this proxy signs host certificates with.
  pub fn ca(&self) -> &Arc<CertificateAuthority> {
    &self.ca
  }
  /// The certificate store consulted when MITM'ing.
  pub fn cert_store(&self) -> &Arc<dyn CertStore> {
    &self.cert_store
  }
  /// The default transport sessions dispatch through.
  pub fn transport(&self) -> Arc<dyn RoundTripper> {
    self.transport.clone()
  }

  pub(crate) fn new_session(self: &Arc<Self>) -> SessionContext {
    SessionContext::new(self.sess.fetch_add(1, Ordering::SeqCst) + 1, self.clone())
  }

  /// Run the request chain: the first handler producing a response
  /// short-circuits it.
  pub(crate) async fn filter_request(
    &self,
    mut req: Request,
    ctx: &mut SessionContext,
  ) -> (Request, Option<Response>) {
    for handler in &self.req_handlers {
      let (next, resp) = handler.handle(req, ctx).await;
      req = next;
      if resp.is_some() {
        return (req, resp);
      }
    }
    (req, None)
  }

  /// Run the response chain; every matching handler may replace the
  /// response.
  pub(crate) async fn filter_response(
    &self,
    mut resp: Option<Response>,
    ctx: &mut SessionContext,
  ) -> Option<Response> {
    for handler in &self.resp_handlers {
      resp = handler.handle(resp, ctx).await;
    }
    ctx.set_response(resp.clone());
    resp
  }

  async fn connect_dial(&self, req: &Request, addr: &str) -> Result<Box<dyn TunnelStream>> {
    if let Some(dial) = &self.connect_dial_with_req {
      return dial.dial(req, addr).await;
    }
    if let Some(dial) = &self.connect_dial {
      return dial.dial(addr).await;
    }
    let stream = self.connector.dial(addr).await?;
    Ok(Box::new(stream))
  }

  /// Bind `addr` and serve until the process exits.
  pub async fn run(self, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    self.serve(listener).await
  }

  /// Serve connections accepted from `listener`, one task per client.
  pub async fn serve(self, listener: TcpListener) -> Result<()> {
    let proxy = Arc::new(self);
    loop {
      match listener.accept().await {
        Ok((stream, peer_addr)) => {
          let proxy = proxy.clone();
          tokio::spawn(async move {
            if let Err(e) = handle_connection(proxy, stream).await {
              debug!(%peer_addr, "connection ended: {}", e);
            }
          });
        }
        Err(e) => {
          error!("failed to accept connection: {}", e);
        }
      }
    }
  }
}

async fn handle_connection(proxy: Arc<ProxyServer>, stream: TcpStream) -> Result<()> {
  let (rd, mut wr) = stream.into_split();
  let mut reader = RequestReader::new(BufReader::new(rd));
  loop {
    if reader.at_eof().await {
      return Ok(());
    }
    let req = reader.read_request().await?;
    if req.method() == Method::CONNECT {
      // hand the raw socket to the tunnel engine, replaying any bytes the
      // parser over-read (e.g. an eagerly sent TLS ClientHello)
      let buf_reader = reader.into_inner();
      let leftover = buf_reader.buffer().to_vec();
      let rd = buf_reader.into_inner();
      let stream = rd
        .reunite(wr)
        .map_err(|e| Error::Other(format!("cannot hijack client connection: {}", e)))?;
      let client = Rewind::new(leftover, stream);
      return handle_connect(proxy, req, client).await;
    }
    let close_after = req.wants_close();
    serve_request(&proxy, req, &mut wr).await?;
    if close_after {
      return Ok(());
    }
  }
}

/// The forward path: filter chains around an outbound round trip, then the
/// reply is streamed back to the client.
async fn serve_request<W>(proxy: &Arc<ProxyServer>, req: Request, wr: &mut W) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let mut ctx = proxy.new_session();
  debug!(
    session = ctx.session(),
    method = %req.method(),
    uri = %req.uri(),
    "got request"
  );
  if req.uri().host().is_none() || req.uri().scheme().is_none() {
    // only absolute-URI forward requests are served; the exchange still
    // completes with an empty reply and the connection stays usable
    wr.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
      .await?;
    wr.flush().await?;
    return Ok(());
  }
  let method = req.method().clone();
  ctx.set_request(req.clone());
  let (req, mut resp) = proxy.filter_request(req, &mut ctx).await;
  ctx.set_request(req.clone());

  if resp.is_none() {
    match ctx.round_tripper().round_trip(req.clone()).await {
      Ok(r) => resp = Some(r),
      Err(e) => ctx.set_error(e),
    }
  }

  let body_before = resp
    .as_ref()
    .and_then(|r| r.body().as_ref())
    .map(|b| b.as_ptr() as usize);
  let resp = proxy.filter_response(resp, &mut ctx).await;
  let mut resp = match resp {
    Some(resp) => resp,
    None => {
      let text = match ctx.error() {
        Some(e) => e.to_string(),
        None => format!(
          "error read response {} : response is nil",
          req.uri().host().unwrap_or_default()
        ),
      };
      debug!(session = ctx.session(), "{}", text);
      write_error_response(wr, StatusCode::INTERNAL_SERVER_ERROR, &text).await?;
      return Ok(());
    }
  };
  debug!(
    session = ctx.session(),
    status = %resp.status_code(),
    "copying response to client"
  );
  let body_after = resp.body().as_ref().map(|b| b.as_ptr() as usize);
  if body_before != body_after {
    // a handler swapped the body; its length is unknown to the proxy
    resp.headers_mut().remove(http::header::CONTENT_LENGTH);
  }
  let mut reply_headers = http::HeaderMap::new();
  copy_headers(
    &mut reply_headers,
    resp.headers(),
    proxy.keep_destination_headers,
  );
  write_forward_response(wr, &method, resp.status_code(), reply_headers, resp.body()).await?;
  Ok(())
}

/// Merge `src` into `dst`; unless `keep_dest_headers` is set, the
/// destination is cleared first.
fn copy_headers(dst: &mut http::HeaderMap, src: &http::HeaderMap, keep_dest_headers: bool) {
  if !keep_dest_headers {
    dst.clear();
  }
  for (k, v) in src.iter() {
    dst.append(k, v.clone());
  }
}

async fn write_forward_response<W>(
  wr: &mut W,
  method: &Method,
  status: StatusCode,
  mut headers: http::HeaderMap,
  body: &Option<crate::Body>,
) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let head_only = !status_permits_body(method, status);
  // any chunked upstream body arrived decoded; reframe explicitly
  headers.remove(http::header::TRANSFER_ENCODING);
  let chunked = !head_only && !headers.contains_key(http::header::CONTENT_LENGTH);
  if chunked {
    headers.insert(
      http::header::TRANSFER_ENCODING,
      HeaderValue::from_static("chunked"),
    );
  }
  let flush_every_write = headers
    .get(http::header::CONTENT_TYPE)
    .map(|v| v.as_bytes().starts_with(b"text/event-stream"))
    .unwrap_or(false);

  let mut head = Vec::new();
  head.extend(b"HTTP/1.1 ");
  head.extend(status.as_str().as_bytes());
  if let Some(reason) = status.canonical_reason() {
    head.push(b' ');
    head.extend(reason.as_bytes());
  }
  head.extend(b"\r\n");
  for (k, v) in headers.iter() {
    head.extend(k.as_str().as_bytes());
    head.extend(b": ");
    head.extend(v.as_bytes());
    head.extend(b"\r\n");
  }
  head.extend(b"\r\n");
  wr.write_all(&head).await?;

  if !head_only {
    if chunked {
      write_chunked_body(wr, body, flush_every_write).await?;
    } else if let Some(body) = body {
      wr.write_all(body).await?;
    }
  }
  wr.flush().await?;
  Ok(())
}

/// Write a body as chunked transfer coding, terminated by the zero chunk.
async fn write_chunked_body<W>(
  wr: &mut W,
  body: &Option<crate::Body>,
  flush_every_write: bool,
) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  if let Some(body) = body {
    for chunk in body.chunks(8192) {
      wr.write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
        .await?;
      wr.write_all(chunk).await?;
      wr.write_all(b"\r\n").await?;
      if flush_every_write {
        wr.flush().await?;
      }
    }
  }
  wr.write_all(b"0\r\n\r\n").await?;
  Ok(())
}

async fn write_error_response<W>(wr: &mut W, status: StatusCode, text: &str) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let body = format!("{}\n", text);
  let msg = format!(
    "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
    status.as_str(),
    status.canonical_reason().unwrap_or_default(),
    body.len(),
    body
  );
  wr.write_all(msg.as_bytes()).await?;
  wr.flush().await?;
  Ok(())
}

/// `502 Bad Gateway` with the error text as body, written to a hijacked
/// socket.
async fn http_error<W>(wr: &mut W, err: &Error)
where
  W: AsyncWrite + Unpin,
{
  let text = err.to_string();
  let msg = format!(
    "HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
    text.len(),
    text
  );
  if let Err(e) = wr.write_all(msg.as_bytes()).await {
    warn!("error responding to client: {}", e);
  }
  let _ = wr.shutdown().await;
}

/// The CONNECT engine: consult the CONNECT handler chain, then splice,
/// reject, MITM, or hijack the tunnel.
async fn handle_connect(
  proxy: Arc<ProxyServer>,
  connect_req: Request,
  client: Rewind<TcpStream>,
) -> Result<()> {
  let mut ctx = proxy.new_session();
  ctx.set_cert_store(proxy.cert_store.clone());
  ctx.set_request(connect_req.clone());
  debug!(
    session = ctx.session(),
    "running {} CONNECT handlers",
    proxy.connect_handlers.len()
  );

  let mut todo = ConnectAction::accept();
  let mut host = connect_req
    .uri()
    .authority()
    .map(|a| a.to_string())
    .unwrap_or_default();
  for (i, handler) in proxy.connect_handlers.iter().enumerate() {
    if let Some((new_todo, new_host)) = handler.handle_connect(&host, &mut ctx) {
      todo = new_todo;
      host = new_host;
      debug!(
        session = ctx.session(),
        "on {}th handler: {:?} {}",
        i,
        todo.kind(),
        host
      );
      break;
    }
  }

  let mut client = client;
  match todo.kind() {
    ConnectKind::Accept => {
      if !has_port(&host) {
        host.push_str(":80");
      }
      let upstream = match proxy.connect_dial(&connect_req, &host).await {
        Ok(upstream) => upstream,
        Err(e) => {
          warn!(session = ctx.session(), "error dialing to {}: {}", host, e);
          http_error(&mut client, &e).await;
          return Ok(());
        }
      };
      debug!(session = ctx.session(), "accepting CONNECT to {}", host);
      client
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;
      splice(client, upstream).await;
      Ok(())
    }
    ConnectKind::Reject => {
      debug!(session = ctx.session(), "rejecting CONNECT to {}", host);
      // dropping the socket closes it without a reply
      Ok(())
    }
    ConnectKind::Mitm => {
      client.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await?;
      debug!(
        session = ctx.session(),
        "assuming CONNECT is TLS, mitm proxying it"
      );
      let config = match &todo.tls_config {
        Some(provider) => provider.server_config(&host, &ctx).await,
        None => tls_config_from_ca(proxy.ca(), &host, &ctx).await,
      };
      let config = match config {
        Ok(config) => config,
        Err(e) => {
          http_error(&mut client, &e).await;
          return Ok(());
        }
      };
      let acceptor = TlsAcceptor::from(Arc::new(config));
      let tls = match acceptor.accept(client).await {
        Ok(tls) => tls,
        Err(e) => {
          warn!(
            session = ctx.session(),
            "cannot handshake client {}: {}", host, e
          );
          return Ok(());
        }
      };
      mitm_loop(proxy, &ctx, tls, host).await
    }
    ConnectKind::Hijack => {
      if let Some(handler) = todo.hijack.clone() {
        handler
          .hijack(connect_req.clone(), &mut ctx, Box::new(client))
          .await;
      } else {
        warn!(
          session = ctx.session(),
          "hijack action without a handler, closing tunnel to {}", host
        );
      }
      Ok(())
    }
  }
}

/// Copy bytes both ways until each direction EOFs, half-closing the write
/// side as its source drains.
async fn splice(client: Rewind<TcpStream>, upstream: Box<dyn TunnelStream>) {
  let (mut client_rd, mut client_wr) = tokio::io::split(client);
  let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);
  let client_to_upstream = async {
    if let Err(e) = tokio::io::copy(&mut client_rd, &mut upstream_wr).await {
      warn!("error copying to upstream: {}", e);
    }
    let _ = upstream_wr.shutdown().await;
  };
  let upstream_to_client = async {
    if let Err(e) = tokio::io::copy(&mut upstream_rd, &mut client_wr).await {
      warn!("error copying to client: {}", e);
    }
    let _ = client_wr.shutdown().await;
  };
  tokio::join!(client_to_upstream, upstream_to_client);
}

/// The default MITM TLS configuration: a leaf for `host` minted from the
/// proxy CA, memoized through the session's certificate store.
pub(crate) async fn tls_config_from_ca(
  ca: &Arc<CertificateAuthority>,
  host: &str,
  ctx: &SessionContext,
) -> Result<ServerConfig> {
  let hostname = strip_port(host).to_string();
  debug!(session = ctx.session(), "signing cert for {}", hostname);
  let ca = ca.clone();
  let gen = move || ca.sign_host(&[hostname.as_str()]);
  let leaf = match ctx.cert_store() {
    Some(store) => store.fetch(strip_port(host), &gen).await?,
    None => Arc::new(gen()?),
  };
  server_config(&leaf)
}

/// The inner-request loop over a MITM'd TLS stream.
async fn mitm_loop<S>(
  proxy: Arc<ProxyServer>,
  outer_ctx: &SessionContext,
  tls: S,
  outer_host: String,
) -> Result<()>
where
  S: AsyncRead + AsyncWrite + Send + Unpin,
{
  let (rd, mut wr) = tokio::io::split(tls);
  let mut reader = RequestReader::new(BufReader::new(rd));
  loop {
    if reader.at_eof().await {
      break;
    }
    let mut req = match reader.read_request().await {
      Ok(req) => req,
      Err(e) => {
        warn!(
          "cannot read TLS request from mitm'd client {}: {}",
          outer_host, e
        );
        break;
      }
    };
    let mut ctx = proxy.new_session();
    ctx.set_cert_store(proxy.cert_store.clone());
    ctx.inherit_user_data(outer_ctx.clone_user_data());
    debug!(session = ctx.session(), uri = %req.uri(), "mitm request for {}", outer_host);

    if req.uri().scheme_str() != Some("https") {
      let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
      let rewritten = format!("https://{}{}", outer_host, path_and_query);
      match rewritten.parse::<Uri>() {
        Ok(uri) => *req.uri_mut() = uri,
        Err(e) => {
          warn!("illegal URL {}: {}", rewritten, e);
          break;
        }
      }
    }
    ctx.set_request(req.clone());

    let (req, resp) = proxy.filter_request(req, &mut ctx).await;
    ctx.set_request(req.clone());
    let resp = match resp {
      Some(resp) => Some(resp),
      None => {
        let mut outbound = req.clone();
        remove_proxy_headers(&mut outbound);
        match ctx.round_tripper().round_trip(outbound).await {
          Ok(resp) => {
            debug!(session = ctx.session(), status = %resp.status_code(), "mitm response");
            Some(resp)
          }
          Err(e) => {
            warn!("cannot read TLS response from mitm'd server: {}", e);
            break;
          }
        }
      }
    };
    let resp = proxy.filter_response(resp, &mut ctx).await;
    let resp = match resp {
      Some(resp) => resp,
      None => {
        warn!("response handlers dropped mitm'd response");
        break;
      }
    };
    let head = req.method() == Method::HEAD;
    if let Err(e) = write_mitm_response(&mut wr, head, resp).await {
      warn!("cannot write TLS response to mitm'd client: {}", e);
      break;
    }
  }
  debug!("exiting on EOF");
  Ok(())
}

/// Serialize a response over the MITM'd TLS stream: chunked re-framing and
/// `Connection: close`, except that `HEAD` replies keep their original
/// framing and carry no body.
async fn write_mitm_response<W>(wr: &mut W, head: bool, mut resp: Response) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let mut out = Vec::new();
  out.extend(b"HTTP/1.1 ");
  out.extend(resp.status_code().as_str().as_bytes());
  if let Some(reason) = resp.status_code().canonical_reason() {
    out.push(b' ');
    out.extend(reason.as_bytes());
  }
  out.extend(b"\r\n");
  if !head {
    resp.headers_mut().remove(http::header::CONTENT_LENGTH);
    resp.headers_mut().insert(
      http::header::TRANSFER_ENCODING,
      HeaderValue::from_static("chunked"),
    );
  }
  resp
    .headers_mut()
    .insert(http::header::CONNECTION, HeaderValue::from_static("close"));
  for (k, v) in resp.headers().iter() {
    out.extend(k.as_str().as_bytes());
    out.extend(b": ");
    out.extend(v.as_bytes());
    out.extend(b"\r\n");
  }
  out.extend(b"\r\n");
  wr.write_all(&out).await?;
  if !head {
    write_chunked_body(wr, resp.body(), false).await?;
  }
  wr.flush().await?;
  Ok(())
}

/// Strip hop-by-hop and proxy-only headers before dispatching a MITM'd
/// request upstream. `Accept-Encoding` goes too: the transport negotiates
/// its own compression.
fn remove_proxy_headers(req: &mut Request) {
  let headers = req.headers_mut();
  headers.remove(http::header::ACCEPT_ENCODING);
  headers.remove("proxy-connection");
  headers.remove(http::header::PROXY_AUTHENTICATE);
  headers.remove(http::header::PROXY_AUTHORIZATION);
  headers.remove(http::header::CONNECTION);
  headers.remove("keep-alive");
  headers.remove(http::header::TE);
  headers.remove(http::header::TRAILER);
  headers.remove(http::header::TRANSFER_ENCODING);
  headers.remove(http::header::UPGRADE);
}

/// A [`ConnectDial`] that opens tunnels through an upstream HTTP proxy
/// using a standard `CONNECT` preamble, with `Basic` credentials taken from
/// the proxy URL's userinfo.
///
/// An `https` proxy URL makes the hop to the upstream proxy itself TLS;
/// supply a client configuration trusted for that hop with
/// [`with_tls_config`](Self::with_tls_config).
pub struct ProxyConnectDial {
  proxy: Uri,
  connector: Connector,
  tls: Option<Arc<ClientConfig>>,
}

impl ProxyConnectDial {
  /// TLS client configuration for `https` upstream proxies.
  pub fn with_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
    self.tls = Some(config);
    self
  }
}

/// Build a [`ConnectDial`] chaining tunnels through the proxy at
/// `proxy_url` (scheme `http` or `https`).
pub fn connect_dial_to_proxy(proxy_url: Uri) -> Result<ProxyConnectDial> {
  match proxy_url.scheme_str() {
    None | Some("http") | Some("https") => Ok(ProxyConnectDial {
      proxy: proxy_url,
      connector: Connector::default(),
      tls: None,
    }),
    Some(other) => Err(Error::UnsupportedProtocol(other.to_string())),
  }
}

#[async_trait]
impl ConnectDial for ProxyConnectDial {
  async fn dial(&self, addr: &str) -> Result<Box<dyn TunnelStream>> {
    let proxy_addr = canonical_addr(&self.proxy);
    let auth = proxy_auth_from_uri(&self.proxy);
    let stream = self.connector.dial(&proxy_addr).await?;
    if self.proxy.scheme_str() == Some("https") {
      let config = self.tls.clone().ok_or_else(|| {
        Error::Handshake("https proxy requires a TLS client configuration".to_string())
      })?;
      let mut tls = self
        .connector
        .upgrade_to_tls(stream, config, strip_port(&proxy_addr))
        .await?;
      connect_preamble(&mut tls, addr, auth.as_ref()).await?;
      Ok(Box::new(tls))
    } else {
      let mut stream = stream;
      connect_preamble(&mut stream, addr, auth.as_ref()).await?;
      Ok(Box::new(stream))
    }
  }
}
