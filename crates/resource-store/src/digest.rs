//! Content digests used as blob tags.
//!
//! A tag is the lowercase hex BLAKE3 hash of the payload. It is a pure function of
//! the bytes, stable across processes and releases, and doubles as the HTTP entity
//! tag for custom resources.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Length of a tag in hex characters.
pub const TAG_LEN: usize = blake3::OUT_LEN * 2;

/// Content-derived identifier of a blob.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentTag(String);

impl ContentTag {
    /// Compute the tag of `data`.
    pub fn compute(data: &[u8]) -> Self {
        Self(blake3::hash(data).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap a tag read back from storage without re-validating it.
    pub(crate) fn from_stored(raw: String) -> Self {
        Self(raw)
    }
}

/// Digest function over payload bytes.
pub fn digest(data: &[u8]) -> ContentTag {
    ContentTag::compute(data)
}

impl FromStr for ContentTag {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != TAG_LEN {
            return Err(StoreError::InvalidArgument(format!(
                "expected {TAG_LEN} hex chars in tag, got {}",
                s.len()
            )));
        }
        if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(StoreError::InvalidArgument(format!(
                "tag is not lowercase hex: {s}"
            )));
        }
        Ok(Self(s.to_string()))
    }
}

impl fmt::Debug for ContentTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Stored tags are not re-validated, so cut on a char boundary.
        let end = self.0.char_indices().nth(16).map_or(self.0.len(), |(i, _)| i);
        write!(f, "ContentTag({})", &self.0[..end])
    }
}

impl fmt::Display for ContentTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentTag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
