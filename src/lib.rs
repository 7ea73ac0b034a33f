//! # wiretap
//!
//! An intercepting HTTP/HTTPS forward proxy with optional man-in-the-middle
//! interception of TLS tunnels.
//!
//! Clients configure a [`ProxyServer`] as their HTTP proxy. Plain-HTTP
//! requests are forwarded through a keep-alive [`Transport`]; `CONNECT`
//! tunnels are either spliced byte-for-byte to the upstream or terminated
//! with a certificate minted on the fly by the embedded
//! [`CertificateAuthority`], so that registered handlers can observe and
//! rewrite the decrypted requests and responses.
//!
//! ## Blocking a host
//!
//! ```no_run
//! use wiretap::{CertificateAuthority, ProxyServer, Response};
//! use wiretap::handlers::dst_host_is;
//! use http::StatusCode;
//!
//! #[tokio::main]
//! async fn main() -> wiretap::Result<()> {
//!   let ca = CertificateAuthority::generate()?;
//!   let mut proxy = ProxyServer::new(ca);
//!   proxy.on_request().when(dst_host_is("www.reddit.com")).do_fn(|req, _ctx| {
//!     let resp = Response::canned(StatusCode::FORBIDDEN, "No Reddit at work time");
//!     (req, Some(resp))
//!   });
//!   proxy.run("127.0.0.1:8080").await
//! }
//! ```
//!
//! ## Intercepting TLS
//!
//! ```no_run
//! use wiretap::{CertificateAuthority, ProxyServer};
//! use wiretap::handlers::AlwaysMitm;
//!
//! #[tokio::main]
//! async fn main() -> wiretap::Result<()> {
//!   let ca = CertificateAuthority::generate()?;
//!   let mut proxy = ProxyServer::new(ca);
//!   proxy.on_request().handle_connect(AlwaysMitm);
//!   proxy.run("127.0.0.1:8080").await
//! }
//! ```
//!
//! The CA certificate ([`CertificateAuthority::ca_cert_pem`]) must be
//! trusted by the client for MITM interception to succeed.

mod body;
/// certificate authority, per-host leaf minting and the certificate cache
pub mod ca;
mod connector;
mod ctx;
mod errors;
/// handler registration: conditions, request/response handlers, CONNECT actions
pub mod handlers;
mod proxy;
mod request;
mod response;
mod socket;
/// keep-alive HTTP transport with per-host idle connection pools
pub mod transport;

pub use body::Body;
pub use ca::{CertStore, CertificateAuthority, CertifiedLeaf, MokaCertStore};
pub use connector::Connector;
pub use ctx::SessionContext;
pub use errors::{Error, Result};
pub use handlers::{ConnectAction, ConnectHandler, RequestHandler, ResponseHandler};
pub use proxy::{connect_dial_to_proxy, ConnectDial, ConnectDialWithReq, ProxyServer};
pub use request::Request;
pub use response::{Response, CONTENT_TYPE_TEXT};
pub use socket::TunnelStream;
pub use transport::{proxy_from_environment, RoundTripDetails, RoundTripper, Transport};

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
