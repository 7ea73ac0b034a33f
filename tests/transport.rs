//! Transport-level tests: gzip transparency, pooling, response pairing.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use wiretap::transport::RoundTripper;
use wiretap::{Request, Transport};

fn get_request(addr: SocketAddr, path: &str) -> Request {
  Request::builder()
    .uri(format!("http://{addr}{path}"))
    .body(None::<Vec<u8>>)
    .unwrap()
    .into()
}

/// Upstream that answers each request with `make_response(request_head)`.
async fn start_upstream<F>(make_response: F) -> (SocketAddr, Arc<AtomicUsize>)
where
  F: Fn(&str) -> Vec<u8> + Send + Sync + Clone + 'static,
{
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
      let make_response = make_response.clone();
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
          let response = make_response(&String::from_utf8_lossy(&head));
          if stream.write_all(&response).await.is_err() {
            return;
          }
        }
      });
    }
  });
  (addr, conns)
}

fn gzip_bytes(data: &[u8]) -> Vec<u8> {
  let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
  encoder.write_all(data).unwrap();
  encoder.finish().unwrap()
}

#[tokio::test]
async fn gzip_responses_are_transparently_decoded() {
  let payload = gzip_bytes(b"the decoded payload");
  let (addr, _conns) = start_upstream(move |head| {
    // the transport injected the header itself
    assert!(head.to_ascii_lowercase().contains("accept-encoding: gzip"));
    let mut resp = format!(
      "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
      payload.len()
    )
    .into_bytes();
    resp.extend_from_slice(&payload);
    resp
  })
  .await;

  let transport = Transport::new();
  let (details, resp) = transport
    .detailed_round_trip(get_request(addr, "/"))
    .await
    .unwrap();
  assert!(!details.is_proxy);
  assert!(details.peer_addr.is_some());
  assert_eq!(
    resp.body().as_ref().map(|b| b.as_ref()),
    Some(b"the decoded payload".as_ref())
  );
  assert!(resp.headers().get(http::header::CONTENT_ENCODING).is_none());
  assert_eq!(resp.content_length(), None);
}

#[tokio::test]
async fn caller_supplied_accept_encoding_is_not_decoded() {
  let payload = gzip_bytes(b"raw gzip for the caller");
  let expected = payload.clone();
  let (addr, _conns) = start_upstream(move |_head| {
    let mut resp = format!(
      "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
      payload.len()
    )
    .into_bytes();
    resp.extend_from_slice(&payload);
    resp
  })
  .await;

  let transport = Transport::new();
  let mut req = get_request(addr, "/");
  req.headers_mut().insert(
    http::header::ACCEPT_ENCODING,
    http::HeaderValue::from_static("gzip"),
  );
  let resp = transport.round_trip(req).await.unwrap();
  // the caller asked for gzip itself, so the body arrives still encoded
  assert_eq!(resp.body().as_ref().map(|b| b.to_vec()), Some(expected));
  assert!(resp.headers().get(http::header::CONTENT_ENCODING).is_some());
}

#[tokio::test]
async fn sequential_requests_reuse_one_connection_in_order() {
  let counter = Arc::new(AtomicUsize::new(0));
  let served = counter.clone();
  let (addr, conns) = start_upstream(move |_head| {
    let n = served.fetch_add(1, Ordering::SeqCst);
    let body = format!("reply-{n}");
    format!(
      "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
      body.len(),
      body
    )
    .into_bytes()
  })
  .await;

  let transport = Transport::new();
  for n in 0..3 {
    let resp = transport.round_trip(get_request(addr, "/")).await.unwrap();
    assert_eq!(resp.text(), format!("reply-{n}"));
  }
  assert_eq!(conns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn connection_close_responses_are_not_pooled() {
  let (addr, conns) = start_upstream(|_head| {
    b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok".to_vec()
  })
  .await;

  let transport = Transport::new();
  for _ in 0..2 {
    let resp = transport.round_trip(get_request(addr, "/")).await.unwrap();
    assert_eq!(resp.text(), "ok");
  }
  // every response asked for teardown, so each request dialed anew
  assert_eq!(conns.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn disabled_keepalives_never_pool() {
  let (addr, conns) =
    start_upstream(|_head| b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec()).await;

  let transport = Transport::new().disable_keepalives(true);
  for _ in 0..2 {
    transport.round_trip(get_request(addr, "/")).await.unwrap();
  }
  assert_eq!(conns.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn concurrent_requests_settle_into_bounded_pool() {
  let (addr, conns) =
    start_upstream(|_head| b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec()).await;

  let transport = Arc::new(Transport::new());
  let (a, b, c) = tokio::join!(
    transport.round_trip(get_request(addr, "/")),
    transport.round_trip(get_request(addr, "/")),
    transport.round_trip(get_request(addr, "/")),
  );
  a.unwrap();
  b.unwrap();
  c.unwrap();
  let dialed = conns.load(Ordering::SeqCst);
  assert!(dialed <= 3);

  // follow-up requests are satisfied from the idle pool (max 2 kept)
  for _ in 0..2 {
    transport.round_trip(get_request(addr, "/")).await.unwrap();
  }
  assert_eq!(conns.load(Ordering::SeqCst), dialed);
}

#[tokio::test]
async fn unsupported_scheme_is_rejected() {
  let transport = Transport::new();
  let req: Request = Request::builder()
    .uri("ftp://example.com/file")
    .body(None::<Vec<u8>>)
    .unwrap()
    .into();
  let err = transport.round_trip(req).await.unwrap_err();
  assert!(matches!(err, wiretap::Error::UnsupportedProtocol(s) if s == "ftp"));
}
