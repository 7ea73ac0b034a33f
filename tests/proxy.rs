//! End-to-end tests driving a real proxy over loopback sockets.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use wiretap::handlers::{dst_host_is, AlwaysMitm, AlwaysReject};
use wiretap::{CertStore, CertificateAuthority, CertifiedLeaf, MokaCertStore, ProxyServer, Response};

/// Minimal keep-alive HTTP upstream: answers every request with `response`
/// and counts accepted connections.
async fn start_upstream(response: &'static [u8]) -> (SocketAddr, Arc<AtomicUsize>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let conns = Arc::new(AtomicUsize::new(0));
  let accepted = conns.clone();
  tokio::spawn(async move {
    loop {
      let (mut stream, _) = match listener.accept().await {
        Ok(conn) => conn,
        Err(_) => return,
      };
      accepted.fetch_add(1, Ordering::SeqCst);
      tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
          let mut head = Vec::new();
          loop {
            let n = match stream.read(&mut buf).await {
              Ok(0) | Err(_) => return,
              Ok(n) => n,
            };
            head.extend_from_slice(&buf[..n]);
            if head.windows(4).any(|w| w == b"\r\n\r\n") {
              break;
            }
          }
          if stream.write_all(response).await.is_err() {
            return;
          }
        }
      });
    }
  });
  (addr, conns)
}

async fn start_proxy(proxy: ProxyServer) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let _ = proxy.serve(listener).await;
  });
  addr
}

/// Read one response with explicit `Content-Length` framing off the stream.
async fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
  let mut head = Vec::new();
  let mut byte = [0u8; 1];
  while !head.ends_with(b"\r\n\r\n") {
    let n = stream.read(&mut byte).await.unwrap();
    assert!(n > 0, "eof before end of headers");
    head.push(byte[0]);
  }
  let head_text = String::from_utf8(head).unwrap();
  let content_length: usize = head_text
    .lines()
    .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().parse().unwrap()))
    .unwrap_or(0);
  let mut body = vec![0u8; content_length];
  stream.read_exact(&mut body).await.unwrap();
  (head_text, body)
}

#[tokio::test]
async fn forward_request_blocked_by_host_condition() {
  let ca = CertificateAuthority::generate().unwrap();
  let mut proxy = ProxyServer::new(ca);
  proxy
    .on_request()
    .when(dst_host_is("www.reddit.com"))
    .do_fn(|req, _ctx| {
      (
        req,
        Some(Response::canned(
          StatusCode::FORBIDDEN,
          "No Reddit at work time",
        )),
      )
    });
  let proxy_addr = start_proxy(proxy).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  client
    .write_all(b"GET http://www.reddit.com/ HTTP/1.1\r\nHost: www.reddit.com\r\n\r\n")
    .await
    .unwrap();
  let (head, body) = read_response(&mut client).await;
  assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{head}");
  assert!(head.to_ascii_lowercase().contains("content-type: text/plain"));
  assert_eq!(body, b"No Reddit at work time");
}

#[tokio::test]
async fn forward_request_passes_through_and_pools_connection() {
  let (upstream, conns) =
    start_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").await;
  let ca = CertificateAuthority::generate().unwrap();
  let proxy = ProxyServer::new(ca);
  let proxy_addr = start_proxy(proxy).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  for _ in 0..2 {
    let raw = format!("GET http://{upstream}/ HTTP/1.1\r\nHost: {upstream}\r\n\r\n");
    client.write_all(raw.as_bytes()).await.unwrap();
    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert_eq!(body, b"hello");
  }
  // the upstream connection was returned to the idle pool and reused
  assert_eq!(conns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn non_absolute_request_gets_empty_reply_and_keeps_connection() {
  let ca = CertificateAuthority::generate().unwrap();
  let mut proxy = ProxyServer::new(ca);
  proxy
    .on_request()
    .when(dst_host_is("www.reddit.com"))
    .do_fn(|req, _ctx| {
      (
        req,
        Some(Response::canned(
          StatusCode::FORBIDDEN,
          "No Reddit at work time",
        )),
      )
    });
  let proxy_addr = start_proxy(proxy).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  client
    .write_all(b"GET /not-a-proxy-request HTTP/1.1\r\nHost: somewhere\r\n\r\n")
    .await
    .unwrap();
  let (head, body) = read_response(&mut client).await;
  assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
  assert!(body.is_empty());

  // the connection survives for the next, well-formed request
  client
    .write_all(b"GET http://www.reddit.com/ HTTP/1.1\r\nHost: www.reddit.com\r\n\r\n")
    .await
    .unwrap();
  let (head, body) = read_response(&mut client).await;
  assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{head}");
  assert_eq!(body, b"No Reddit at work time");
}

#[tokio::test]
async fn forward_request_with_unreachable_upstream_reports_500() {
  let ca = CertificateAuthority::generate().unwrap();
  let proxy = ProxyServer::new(ca);
  let proxy_addr = start_proxy(proxy).await;

  // a bound-then-dropped listener gives a port with nothing listening
  let dead = {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
  };
  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  let raw = format!("GET http://{dead}/ HTTP/1.1\r\nHost: {dead}\r\n\r\n");
  client.write_all(raw.as_bytes()).await.unwrap();
  let (head, body) = read_response(&mut client).await;
  assert!(head.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{head}");
  assert!(String::from_utf8_lossy(&body).contains("error dialing"));
}

#[tokio::test]
async fn connect_splice_relays_bytes_verbatim() {
  // raw TCP upstream: expects 16 bytes, replies with 8, then closes
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let upstream = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut buf = [0u8; 16];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, [b'A'; 16]);
    stream.write_all(&[b'B'; 8]).await.unwrap();
  });

  let ca = CertificateAuthority::generate().unwrap();
  let proxy = ProxyServer::new(ca);
  let proxy_addr = start_proxy(proxy).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  let raw = format!("CONNECT {upstream} HTTP/1.1\r\n\r\n");
  client.write_all(raw.as_bytes()).await.unwrap();

  let mut reply = Vec::new();
  let mut byte = [0u8; 1];
  while !reply.ends_with(b"\r\n\r\n") {
    assert!(client.read(&mut byte).await.unwrap() > 0);
    reply.push(byte[0]);
  }
  assert_eq!(reply, b"HTTP/1.1 200 Connection established\r\n\r\n");

  client.write_all(&[b'A'; 16]).await.unwrap();
  let mut back = Vec::new();
  client.read_to_end(&mut back).await.unwrap();
  assert_eq!(back, vec![b'B'; 8]);
}

#[tokio::test]
async fn connect_reject_closes_without_reply() {
  let ca = CertificateAuthority::generate().unwrap();
  let mut proxy = ProxyServer::new(ca);
  proxy.on_request().handle_connect(AlwaysReject);
  let proxy_addr = start_proxy(proxy).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  client
    .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
    .await
    .unwrap();
  let mut out = Vec::new();
  client.read_to_end(&mut out).await.unwrap();
  assert!(out.is_empty());
}

/// Counts how often the proxy actually mints a certificate.
struct CountingStore {
  inner: MokaCertStore,
  gen_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl CertStore for CountingStore {
  async fn fetch(
    &self,
    hostname: &str,
    gen: &(dyn Fn() -> wiretap::Result<CertifiedLeaf> + Send + Sync),
  ) -> wiretap::Result<Arc<CertifiedLeaf>> {
    let calls = self.gen_calls.clone();
    let counted = move || {
      calls.fetch_add(1, Ordering::SeqCst);
      gen()
    };
    self.inner.fetch(hostname, &counted).await
  }
}

fn tls_client_config(ca: &CertificateAuthority) -> Arc<ClientConfig> {
  let mut roots = RootCertStore::empty();
  roots.add(ca.ca_cert_der().clone()).unwrap();
  Arc::new(
    ClientConfig::builder()
      .with_root_certificates(roots)
      .with_no_client_auth(),
  )
}

/// CONNECT through the proxy, TLS-handshake against the minted certificate,
/// send one GET, return (head, chunked-decoded body).
async fn mitm_round_trip(
  proxy_addr: SocketAddr,
  tls_config: Arc<ClientConfig>,
  target: SocketAddr,
) -> (String, Vec<u8>) {
  let mut tcp = TcpStream::connect(proxy_addr).await.unwrap();
  let raw = format!("CONNECT {target} HTTP/1.1\r\n\r\n");
  tcp.write_all(raw.as_bytes()).await.unwrap();
  let mut reply = Vec::new();
  let mut byte = [0u8; 1];
  while !reply.ends_with(b"\r\n\r\n") {
    assert!(tcp.read(&mut byte).await.unwrap() > 0);
    reply.push(byte[0]);
  }
  assert!(reply.starts_with(b"HTTP/1.1 200"));

  let connector = TlsConnector::from(tls_config);
  let server_name = ServerName::try_from(target.ip().to_string()).unwrap();
  let mut tls = connector.connect(server_name, tcp).await.unwrap();

  let raw = format!("GET / HTTP/1.1\r\nHost: {target}\r\n\r\n");
  tls.write_all(raw.as_bytes()).await.unwrap();

  let mut out = Vec::new();
  let mut buf = [0u8; 1024];
  while !ends_with_final_chunk(&out) {
    match tls.read(&mut buf).await {
      Ok(0) | Err(_) => break,
      Ok(n) => out.extend_from_slice(&buf[..n]),
    }
  }
  let split = out.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
  let head = String::from_utf8_lossy(&out[..split + 4]).to_string();
  let body = decode_chunked(&out[split + 4..]);
  (head, body)
}

fn ends_with_final_chunk(buf: &[u8]) -> bool {
  buf.ends_with(b"0\r\n\r\n")
}

fn decode_chunked(mut data: &[u8]) -> Vec<u8> {
  let mut body = Vec::new();
  loop {
    let line_end = data.windows(2).position(|w| w == b"\r\n").unwrap();
    let size = usize::from_str_radix(
      std::str::from_utf8(&data[..line_end]).unwrap().trim(),
      16,
    )
    .unwrap();
    data = &data[line_end + 2..];
    if size == 0 {
      break;
    }
    body.extend_from_slice(&data[..size]);
    data = &data[size + 2..];
  }
  body
}

#[tokio::test]
async fn connect_mitm_rewrites_to_plain_http() {
  let (upstream, _conns) =
    start_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").await;

  let ca = CertificateAuthority::generate().unwrap();
  let tls_config = tls_client_config(&ca);
  let mut proxy = ProxyServer::new(ca);
  proxy.on_request().handle_connect(AlwaysMitm);
  // downgrade the decrypted request to plain http toward the upstream
  proxy.on_request().do_fn(|mut req, _ctx| {
    let mut parts = req.uri().clone().into_parts();
    parts.scheme = Some(http::uri::Scheme::HTTP);
    *req.uri_mut() = http::Uri::from_parts(parts).unwrap();
    (req, None)
  });
  let proxy_addr = start_proxy(proxy).await;

  let (head, body) = mitm_round_trip(proxy_addr, tls_config, upstream).await;
  assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
  let lower = head.to_ascii_lowercase();
  assert!(lower.contains("transfer-encoding: chunked"));
  assert!(lower.contains("connection: close"));
  assert!(!lower.contains("content-length"));
  assert_eq!(body, b"hello");
}

#[tokio::test]
async fn mitm_certificates_are_cached_per_host() {
  let (upstream, _conns) =
    start_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").await;

  let ca = CertificateAuthority::generate().unwrap();
  let tls_config = tls_client_config(&ca);
  let gen_calls = Arc::new(AtomicUsize::new(0));
  let mut proxy = ProxyServer::new(ca);
  proxy.set_cert_store(Arc::new(CountingStore {
    inner: MokaCertStore::default(),
    gen_calls: gen_calls.clone(),
  }));
  proxy.on_request().handle_connect(AlwaysMitm);
  proxy.on_request().do_fn(|mut req, _ctx| {
    let mut parts = req.uri().clone().into_parts();
    parts.scheme = Some(http::uri::Scheme::HTTP);
    *req.uri_mut() = http::Uri::from_parts(parts).unwrap();
    (req, None)
  });
  let proxy_addr = start_proxy(proxy).await;

  for _ in 0..2 {
    let (head, body) = mitm_round_trip(proxy_addr, tls_config.clone(), upstream).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert_eq!(body, b"ok");
  }
  assert_eq!(gen_calls.load(Ordering::SeqCst), 1);
}
