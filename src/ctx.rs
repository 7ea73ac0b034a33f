use std::any::Any;
use std::sync::Arc;

use crate::ca::CertStore;
use crate::errors::Error;
use crate::proxy::ProxyServer;
use crate::request::Request;
use crate::response::Response;
use crate::transport::RoundTripper;

/// Per-session state threaded through the handler chains.
///
/// A context is created for every inbound request and for every inner
/// request of a MITM'd tunnel. It is never shared across sessions; the
/// `user_data` slot is the one piece inner sessions inherit from the
/// `CONNECT` session that spawned them.
pub struct SessionContext {
  session: i64,
  request: Option<Request>,
  response: Option<Response>,
  user_data: Option<Arc<dyn Any + Send + Sync>>,
  round_tripper: Option<Arc<dyn RoundTripper>>,
  cert_store: Option<Arc<dyn CertStore>>,
  error: Option<Error>,
  proxy: Arc<ProxyServer>,
}

impl SessionContext {
  pub(crate) fn new(session: i64, proxy: Arc<ProxyServer>) -> Self {
    Self {
      session,
      request: None,
      response: None,
      user_data: None,
      round_tripper: None,
      cert_store: None,
      error: None,
      proxy,
    }
  }

  /// The session id: unique within the process, monotonically increasing.
  #[inline]
  pub fn session(&self) -> i64 {
    self.session
  }
  /// The request this session is serving.
  ///
  /// Handlers receive the in-flight request by value; this accessor is how
  /// response-side conditions and handlers look back at it.
  pub fn request(&self) -> Option<&Request> {
    self.request.as_ref()
  }
  pub(crate) fn set_request(&mut self, request: Request) {
    self.request = Some(request);
  }
  /// The response, once one is available.
  pub fn response(&self) -> Option<&Response> {
    self.response.as_ref()
  }
  pub(crate) fn set_response(&mut self, response: Option<Response>) {
    self.response = response;
  }
  /// Opaque handler-to-handler state for this session.
  ///
  /// Handlers sharing the slot must agree on the concrete type and
  /// downcast it themselves.
  pub fn user_data(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
    self.user_data.as_ref()
  }
  /// Store opaque per-session state for later handlers (and, on a `CONNECT`
  /// session, for the MITM'd inner sessions).
  pub fn set_user_data(&mut self, data: Arc<dyn Any + Send + Sync>) {
    self.user_data = Some(data);
  }
  pub(crate) fn clone_user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
    self.user_data.clone()
  }
  pub(crate) fn inherit_user_data(&mut self, data: Option<Arc<dyn Any + Send + Sync>>) {
    self.user_data = data;
  }
  /// Override the transport used to dispatch this session's request.
  pub fn set_round_tripper(&mut self, rt: Arc<dyn RoundTripper>) {
    self.round_tripper = Some(rt);
  }
  /// The transport this session will dispatch through.
  pub fn round_tripper(&self) -> Arc<dyn RoundTripper> {
    match &self.round_tripper {
      Some(rt) => rt.clone(),
      None => self.proxy.transport(),
    }
  }
  /// The certificate store consulted when MITM'ing this session.
  pub fn cert_store(&self) -> Option<&Arc<dyn CertStore>> {
    self.cert_store.as_ref()
  }
  pub(crate) fn set_cert_store(&mut self, store: Arc<dyn CertStore>) {
    self.cert_store = Some(store);
  }
  /// The last error encountered in this session, if any.
  pub fn error(&self) -> Option<&Error> {
    self.error.as_ref()
  }
  /// Record an error on the session; with no response produced, the
  /// dispatcher reports it to the client as a 500.
  pub fn set_error(&mut self, error: Error) {
    self.error = Some(error);
  }
  /// The proxy serving this session. The proxy outlives all its sessions.
  pub fn proxy(&self) -> &Arc<ProxyServer> {
    &self.proxy
  }
}
