//! Page token codec.
//!
//! Tokens are opaque to callers: URL-safe base64 over a versioned offset
//! string. Only decoding validates; there is no query state in a token.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use thiserror::Error;

const TOKEN_PREFIX: &str = "o1:";

// Bound on untrusted token input.
const MAX_PAGE_TOKEN_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageTokenError {
  #[error("page token exceeds max length: {len} chars (max {max})")]
  TooLong { len: usize, max: usize },

  #[error("page token is not valid base64")]
  Encoding,

  #[error("page token is malformed")]
  Malformed,
}

/// Encode a row offset as a page token.
#[must_use]
pub fn encode_page_token(offset: usize) -> String {
  URL_SAFE_NO_PAD.encode(format!("{TOKEN_PREFIX}{offset}"))
}

/// Decode a page token into a row offset. Absent or blank tokens mean the
/// first page.
pub fn decode_page_token(token: Option<&str>) -> Result<usize, PageTokenError> {
  let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
    return Ok(0);
  };

  if token.len() > MAX_PAGE_TOKEN_LEN {
    return Err(PageTokenError::TooLong {
      len: token.len(),
      max: MAX_PAGE_TOKEN_LEN,
    });
  }

  let bytes = URL_SAFE_NO_PAD
    .decode(token)
    .map_err(|_| PageTokenError::Encoding)?;
  let text = String::from_utf8(bytes).map_err(|_| PageTokenError::Malformed)?;
  text
    .strip_prefix(TOKEN_PREFIX)
    .and_then(|offset| offset.parse().ok())
    .ok_or(PageTokenError::Malformed)
}
