//! Handler registration and dispatch.
//!
//! Handlers are registered on the server before it starts serving, each
//! guarded by zero or more conditions:
//!
//! ```no_run
//! # use wiretap::{CertificateAuthority, ProxyServer, Response};
//! # use wiretap::handlers::{dst_host_is, AlwaysMitm};
//! # use http::StatusCode;
//! # let ca = CertificateAuthority::generate().unwrap();
//! let mut proxy = ProxyServer::new(ca);
//! proxy.on_request().when(dst_host_is("www.reddit.com")).do_fn(|req, _ctx| {
//!   (req, Some(Response::canned(StatusCode::FORBIDDEN, "No Reddit at work time")))
//! });
//! proxy.on_request().handle_connect(AlwaysMitm);
//! ```
//!
//! Chains run in registration order. The first request handler returning a
//! response short-circuits the chain; conditions that do not match leave the
//! message untouched and pass it along.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_rustls::rustls::ServerConfig;

use crate::ctx::SessionContext;
use crate::errors::Result;
use crate::proxy::ProxyServer;
use crate::request::Request;
use crate::response::Response;
use crate::socket::TunnelStream;

/// A predicate over requests. Response-side queries are answered against
/// the session's request, so request conditions can also guard response
/// handlers.
pub trait ReqCondition: Send + Sync {
  /// Does this condition hold for `req`?
  fn matches_req(&self, req: &Request, ctx: &SessionContext) -> bool;
  /// Response-side evaluation, answered against `ctx.request()`.
  fn matches_resp(&self, _resp: Option<&Response>, ctx: &SessionContext) -> bool {
    match ctx.request() {
      Some(req) => self.matches_req(req, ctx),
      None => false,
    }
  }
}

/// A predicate over responses.
pub trait RespCondition: Send + Sync {
  /// Does this condition hold for `resp`?
  fn matches_resp(&self, resp: &Response, ctx: &SessionContext) -> bool;
}

/// Wrap a closure as a request condition.
pub fn req_cond<F>(f: F) -> impl ReqCondition
where
  F: Fn(&Request, &SessionContext) -> bool + Send + Sync,
{
  FnReqCondition(f)
}

struct FnReqCondition<F>(F);

impl<F> ReqCondition for FnReqCondition<F>
where
  F: Fn(&Request, &SessionContext) -> bool + Send + Sync,
{
  fn matches_req(&self, req: &Request, ctx: &SessionContext) -> bool {
    (self.0)(req, ctx)
  }
}

/// Wrap a closure as a response condition.
pub fn resp_cond<F>(f: F) -> impl RespCondition
where
  F: Fn(&Response, &SessionContext) -> bool + Send + Sync,
{
  FnRespCondition(f)
}

struct FnRespCondition<F>(F);

impl<F> RespCondition for FnRespCondition<F>
where
  F: Fn(&Response, &SessionContext) -> bool + Send + Sync,
{
  fn matches_resp(&self, resp: &Response, ctx: &SessionContext) -> bool {
    (self.0)(resp, ctx)
  }
}

/// A request handler: takes the in-flight request, returns the (possibly
/// rewritten) request plus an optional canned response that short-circuits
/// the chain.
#[async_trait]
pub trait RequestHandler: Send + Sync {
  /// Handle one request.
  async fn handle(&self, req: Request, ctx: &mut SessionContext) -> (Request, Option<Response>);
}

/// A response handler: may replace the response (which is `None` when the
/// dispatch failed and no handler produced one).
#[async_trait]
pub trait ResponseHandler: Send + Sync {
  /// Handle one response.
  async fn handle(&self, resp: Option<Response>, ctx: &mut SessionContext) -> Option<Response>;
}

/// A `CONNECT` handler: decides the disposition of a tunnel. The first
/// handler returning `Some` wins; `None` passes to the next handler.
pub trait ConnectHandler: Send + Sync {
  /// Classify the tunnel to `host`, optionally redirecting it elsewhere.
  fn handle_connect(&self, host: &str, ctx: &mut SessionContext)
    -> Option<(ConnectAction, String)>;
}

/// Supplies the TLS server configuration a MITM'd tunnel is terminated
/// with. The default implementation mints a leaf certificate for the host
/// from the proxy CA, consulting the session's certificate store.
#[async_trait]
pub trait TlsConfigProvider: Send + Sync {
  /// Build the server config presented to the client for `host`.
  async fn server_config(&self, host: &str, ctx: &SessionContext) -> Result<ServerConfig>;
}

/// Receives raw ownership of the client socket for a hijacked tunnel.
#[async_trait]
pub trait HijackHandler: Send + Sync {
  /// Take over the tunnel. The stream starts right after the `CONNECT`
  /// head; no reply has been written yet.
  async fn hijack(&self, req: Request, ctx: &mut SessionContext, client: Box<dyn TunnelStream>);
}

/// What to do with a `CONNECT` tunnel.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConnectKind {
  /// splice bytes between client and upstream without looking inside
  Accept,
  /// close the client socket without establishing the tunnel
  Reject,
  /// terminate TLS with a minted certificate and intercept inner requests
  Mitm,
  /// hand the raw client socket to a user-supplied handler
  Hijack,
}

/// The disposition of a `CONNECT` tunnel, chosen by the CONNECT handler
/// chain. Immutable once constructed.
#[derive(Clone)]
pub struct ConnectAction {
  pub(crate) kind: ConnectKind,
  pub(crate) tls_config: Option<Arc<dyn TlsConfigProvider>>,
  pub(crate) hijack: Option<Arc<dyn HijackHandler>>,
}

impl ConnectAction {
  /// Splice the tunnel through untouched.
  pub fn accept() -> Self {
    Self {
      kind: ConnectKind::Accept,
      tls_config: None,
      hijack: None,
    }
  }
  /// Refuse the tunnel.
  pub fn reject() -> Self {
    Self {
      kind: ConnectKind::Reject,
      tls_config: None,
      hijack: None,
    }
  }
  /// Terminate TLS and intercept, minting certificates from the proxy CA.
  pub fn mitm() -> Self {
    Self {
      kind: ConnectKind::Mitm,
      tls_config: None,
      hijack: None,
    }
  }
  /// Terminate TLS with a custom per-invocation TLS configuration.
  pub fn mitm_with_tls(provider: Arc<dyn TlsConfigProvider>) -> Self {
    Self {
      kind: ConnectKind::Mitm,
      tls_config: Some(provider),
      hijack: None,
    }
  }
  /// Hand the raw socket to `handler`.
  pub fn hijack(handler: Arc<dyn HijackHandler>) -> Self {
    Self {
      kind: ConnectKind::Hijack,
      tls_config: None,
      hijack: Some(handler),
    }
  }
  /// Which disposition this action selects.
  pub fn kind(&self) -> ConnectKind {
    self.kind
  }
}

/// The default [`TlsConfigProvider`]: mints a leaf certificate for the
/// host from a CA, memoized through the session's certificate store. Use
/// this to MITM with a CA other than the server's own.
pub struct CaTlsConfig {
  ca: Arc<crate::ca::CertificateAuthority>,
}

impl CaTlsConfig {
  /// Provider minting from `ca`.
  pub fn new(ca: Arc<crate::ca::CertificateAuthority>) -> Self {
    Self { ca }
  }
}

#[async_trait]
impl TlsConfigProvider for CaTlsConfig {
  async fn server_config(&self, host: &str, ctx: &SessionContext) -> Result<ServerConfig> {
    crate::proxy::tls_config_from_ca(&self.ca, host, ctx).await
  }
}

/// `CONNECT` handler that MITMs every tunnel.
pub struct AlwaysMitm;

impl ConnectHandler for AlwaysMitm {
  fn handle_connect(
    &self,
    host: &str,
    _ctx: &mut SessionContext,
  ) -> Option<(ConnectAction, String)> {
    Some((ConnectAction::mitm(), host.to_string()))
  }
}

/// `CONNECT` handler that splices every tunnel through untouched. This is
/// also what an empty CONNECT chain does; register it to stop later
/// handlers from being consulted.
pub struct AlwaysAccept;

impl ConnectHandler for AlwaysAccept {
  fn handle_connect(
    &self,
    host: &str,
    _ctx: &mut SessionContext,
  ) -> Option<(ConnectAction, String)> {
    Some((ConnectAction::accept(), host.to_string()))
  }
}

/// `CONNECT` handler that rejects every tunnel.
pub struct AlwaysReject;

impl ConnectHandler for AlwaysReject {
  fn handle_connect(
    &self,
    host: &str,
    _ctx: &mut SessionContext,
  ) -> Option<(ConnectAction, String)> {
    Some((ConnectAction::reject(), host.to_string()))
  }
}

/// Condition matching requests whose URL host equals `host` exactly.
///
/// The comparison is case-sensitive and includes an explicit port when the
/// URL carries one: `dst_host_is("a")` does not match `a:80`.
pub fn dst_host_is(host: impl Into<String>) -> DstHostIs {
  DstHostIs(host.into())
}

/// See [`dst_host_is`].
pub struct DstHostIs(String);

impl ReqCondition for DstHostIs {
  fn matches_req(&self, req: &Request, _ctx: &SessionContext) -> bool {
    req.uri().authority().map(|a| a.as_str()) == Some(self.0.as_str())
  }
}

struct FnRequestHandler<F>(F);

#[async_trait]
impl<F> RequestHandler for FnRequestHandler<F>
where
  F: Fn(Request, &mut SessionContext) -> (Request, Option<Response>) + Send + Sync,
{
  async fn handle(&self, req: Request, ctx: &mut SessionContext) -> (Request, Option<Response>) {
    (self.0)(req, ctx)
  }
}

struct FnResponseHandler<F>(F);

#[async_trait]
impl<F> ResponseHandler for FnResponseHandler<F>
where
  F: Fn(Option<Response>, &mut SessionContext) -> Option<Response> + Send + Sync,
{
  async fn handle(&self, resp: Option<Response>, ctx: &mut SessionContext) -> Option<Response> {
    (self.0)(resp, ctx)
  }
}

struct FnConnectHandler<F>(F);

impl<F> ConnectHandler for FnConnectHandler<F>
where
  F: Fn(&str, &mut SessionContext) -> Option<(ConnectAction, String)> + Send + Sync,
{
  fn handle_connect(
    &self,
    host: &str,
    ctx: &mut SessionContext,
  ) -> Option<(ConnectAction, String)> {
    (self.0)(host, ctx)
  }
}

/// Wraps a handler so it only fires when every condition matches;
/// otherwise the request passes through unchanged.
struct GuardedRequestHandler {
  conds: Vec<Box<dyn ReqCondition>>,
  inner: Box<dyn RequestHandler>,
}

#[async_trait]
impl RequestHandler for GuardedRequestHandler {
  async fn handle(&self, req: Request, ctx: &mut SessionContext) -> (Request, Option<Response>) {
    for cond in &self.conds {
      if !cond.matches_req(&req, ctx) {
        return (req, None);
      }
    }
    self.inner.handle(req, ctx).await
  }
}

struct GuardedResponseHandler {
  req_conds: Vec<Box<dyn ReqCondition>>,
  resp_conds: Vec<Box<dyn RespCondition>>,
  inner: Box<dyn ResponseHandler>,
}

#[async_trait]
impl ResponseHandler for GuardedResponseHandler {
  async fn handle(&self, resp: Option<Response>, ctx: &mut SessionContext) -> Option<Response> {
    for cond in &self.req_conds {
      if !cond.matches_resp(resp.as_ref(), ctx) {
        return resp;
      }
    }
    match &resp {
      Some(r) => {
        for cond in &self.resp_conds {
          if !cond.matches_resp(r, ctx) {
            return resp;
          }
        }
      }
      None if !self.resp_conds.is_empty() => return resp,
      None => {}
    }
    self.inner.handle(resp, ctx).await
  }
}

struct GuardedConnectHandler {
  conds: Vec<Box<dyn ReqCondition>>,
  inner: Box<dyn ConnectHandler>,
}

impl ConnectHandler for GuardedConnectHandler {
  fn handle_connect(
    &self,
    host: &str,
    ctx: &mut SessionContext,
  ) -> Option<(ConnectAction, String)> {
    // conditions are evaluated against the CONNECT request itself
    for cond in &self.conds {
      let matched = match ctx.request() {
        Some(req) => cond.matches_req(req, ctx),
        None => false,
      };
      if !matched {
        return None;
      }
    }
    self.inner.handle_connect(host, ctx)
  }
}

/// Builder returned by [`ProxyServer::on_request`]: accumulate conditions
/// with [`when`](Self::when), then register the handler.
#[must_use = "a handler builder does nothing until do_fn/do_handler/handle_connect is called"]
pub struct RequestHandlerBuilder<'a> {
  pub(crate) proxy: &'a mut ProxyServer,
  pub(crate) conds: Vec<Box<dyn ReqCondition>>,
}

impl<'a> RequestHandlerBuilder<'a> {
  /// Guard the handler with `cond`.
  pub fn when(mut self, cond: impl ReqCondition + 'static) -> Self {
    self.conds.push(Box::new(cond));
    self
  }
  /// Register `handler` on the request chain.
  pub fn do_handler(self, handler: impl RequestHandler + 'static) {
    self.proxy.req_handlers.push(Arc::new(GuardedRequestHandler {
      conds: self.conds,
      inner: Box::new(handler),
    }));
  }
  /// Register a closure on the request chain.
  pub fn do_fn(
    self,
    f: impl Fn(Request, &mut SessionContext) -> (Request, Option<Response>) + Send + Sync + 'static,
  ) {
    self.do_handler(FnRequestHandler(f))
  }
  /// Register `handler` on the CONNECT chain.
  pub fn handle_connect(self, handler: impl ConnectHandler + 'static) {
    self
      .proxy
      .connect_handlers
      .push(Arc::new(GuardedConnectHandler {
        conds: self.conds,
        inner: Box::new(handler),
      }));
  }
  /// Register a closure on the CONNECT chain.
  pub fn handle_connect_fn(
    self,
    f: impl Fn(&str, &mut SessionContext) -> Option<(ConnectAction, String)> + Send + Sync + 'static,
  ) {
    self.handle_connect(FnConnectHandler(f))
  }
}

/// Builder returned by [`ProxyServer::on_response`].
#[must_use = "a handler builder does nothing until do_fn/do_handler is called"]
pub struct ResponseHandlerBuilder<'a> {
  pub(crate) proxy: &'a mut ProxyServer,
  pub(crate) req_conds: Vec<Box<dyn ReqCondition>>,
  pub(crate) resp_conds: Vec<Box<dyn RespCondition>>,
}

impl<'a> ResponseHandlerBuilder<'a> {
  /// Guard the handler with a request condition (evaluated against the
  /// session's request).
  pub fn when(mut self, cond: impl ReqCondition + 'static) -> Self {
    self.req_conds.push(Box::new(cond));
    self
  }
  /// Guard the handler with a response condition.
  pub fn when_resp(mut self, cond: impl RespCondition + 'static) -> Self {
    self.resp_conds.push(Box::new(cond));
    self
  }
  /// Register `handler` on the response chain.
  pub fn do_handler(self, handler: impl ResponseHandler + 'static) {
    self
      .proxy
      .resp_handlers
      .push(Arc::new(GuardedResponseHandler {
        req_conds: self.req_conds,
        resp_conds: self.resp_conds,
        inner: Box::new(handler),
      }));
  }
  /// Register a closure on the response chain.
  pub fn do_fn(
    self,
    f: impl Fn(Option<Response>, &mut SessionContext) -> Option<Response> + Send + Sync + 'static,
  ) {
    self.do_handler(FnResponseHandler(f))
  }
}
