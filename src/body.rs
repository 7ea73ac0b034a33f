use bytes::Bytes;
use std::fmt;
use std::ops::{Deref, DerefMut};

/// A fully buffered message body.
///
/// The proxy reads every body to completion before re-framing it toward
/// the other side, so a body is always one contiguous buffer. Cloning is
/// cheap (the buffer is shared), which is what lets handlers pass bodies
/// around without copying.
#[derive(Clone, Default, PartialEq)]
pub struct Body {
  pub(crate) inner: Bytes,
}

impl Body {
  /// The body as raw bytes.
  pub fn as_bytes(&self) -> &[u8] {
    &self.inner
  }
  /// Consume the body, yielding the underlying buffer.
  pub fn into_bytes(self) -> Bytes {
    self.inner
  }
}

impl Deref for Body {
  type Target = Bytes;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl DerefMut for Body {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.inner
  }
}

impl From<Bytes> for Body {
  #[inline]
  fn from(inner: Bytes) -> Body {
    Body { inner }
  }
}

impl From<Vec<u8>> for Body {
  #[inline]
  fn from(v: Vec<u8>) -> Body {
    Bytes::from(v).into()
  }
}

impl From<String> for Body {
  #[inline]
  fn from(s: String) -> Body {
    Bytes::from(s).into()
  }
}

impl From<&'static str> for Body {
  #[inline]
  fn from(s: &'static str) -> Body {
    Bytes::from_static(s.as_bytes()).into()
  }
}

impl From<&'static [u8]> for Body {
  #[inline]
  fn from(s: &'static [u8]) -> Body {
    Bytes::from_static(s).into()
  }
}

impl From<Option<Vec<u8>>> for Body {
  #[inline]
  fn from(v: Option<Vec<u8>>) -> Body {
    v.unwrap_or_default().into()
  }
}

// Bodies routinely carry compressed or TLS-adjacent binary; dumping that
// into logs helps nobody, so non-UTF-8 content renders as a length.
impl fmt::Debug for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(&self.inner) {
      Ok(text) => fmt::Debug::fmt(text, f),
      Err(_) => write!(f, "<{} bytes>", self.inner.len()),
    }
  }
}

impl fmt::Display for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(&self.inner) {
      Ok(text) => f.write_str(text),
      Err(_) => write!(f, "<{} bytes>", self.inner.len()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn conversions_share_one_representation() {
    let from_str: Body = "abc".into();
    let from_vec: Body = b"abc".to_vec().into();
    let from_none: Body = None::<Vec<u8>>.into();
    assert_eq!(from_str, from_vec);
    assert!(from_none.is_empty());
  }

  #[test]
  fn binary_bodies_debug_as_length() {
    let body: Body = vec![0u8, 159, 146, 150].into();
    assert_eq!(format!("{:?}", body), "<4 bytes>");
    let body: Body = "plain".into();
    assert_eq!(format!("{}", body), "plain");
  }
}
