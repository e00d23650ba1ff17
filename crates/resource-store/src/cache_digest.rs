//! Cache validators derived from stored resources.
//!
//! A [`CacheDigest`] is the `(validator, last_modified)` pair an HTTP layer turns into
//! `ETag` / `Last-Modified` headers. [`evaluate`] answers a conditional GET without
//! touching payload bytes.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::error::{Result, StoreError};

/// IMF-fixdate, the preferred HTTP-date format (RFC 9110 section 5.6.7).
const HTTP_DATE: &[FormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Default `max-age` advertised for cacheable resources.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Validator pair for one resource. Derived on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheDigest {
    pub validator: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified: OffsetDateTime,
}

impl CacheDigest {
    pub fn new(validator: impl Into<String>, last_modified: OffsetDateTime) -> Self {
        Self {
            validator: validator.into(),
            last_modified,
        }
    }

    /// Strong entity tag, quoted.
    pub fn etag(&self) -> String {
        format!("\"{}\"", self.validator)
    }

    /// `Last-Modified` header value.
    pub fn http_last_modified(&self) -> Result<String> {
        self.last_modified
            .to_offset(UtcOffset::UTC)
            .format(HTTP_DATE)
            .map_err(|e| StoreError::InvalidArgument(format!("unformattable timestamp: {e}")))
    }
}

/// `Cache-Control` value for private, always-revalidated resources.
pub fn cache_control_value(max_age: Option<Duration>) -> String {
    let max_age = max_age.unwrap_or(DEFAULT_MAX_AGE);
    format!(
        "no-cache, max-age={}, private, must-revalidate",
        max_age.as_secs()
    )
}

/// Outcome of a conditional request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// The client's copy is current; answer 304.
    NotModified,
    /// Send the full payload.
    Modified,
}

/// Evaluate `If-None-Match` / `If-Modified-Since` against `digest`.
///
/// `If-None-Match` takes precedence; `If-Modified-Since` is ignored when both are
/// present. Malformed header values are rejected with `InvalidArgument`.
pub fn evaluate(
    if_none_match: Option<&str>,
    if_modified_since: Option<&str>,
    digest: &CacheDigest,
) -> Result<Freshness> {
    if let Some(value) = if_none_match {
        let matched = parse_entity_tags(value)?
            .iter()
            .any(|tag| match tag {
                EntityTag::Any => true,
                EntityTag::Opaque(opaque) => *opaque == digest.validator,
            });
        return Ok(if matched {
            Freshness::NotModified
        } else {
            Freshness::Modified
        });
    }

    if let Some(value) = if_modified_since {
        let since = parse_http_date(value)?;
        // HTTP dates carry whole seconds only.
        if digest.last_modified.unix_timestamp() <= since.unix_timestamp() {
            return Ok(Freshness::NotModified);
        }
    }

    Ok(Freshness::Modified)
}

/// Parse an IMF-fixdate header value.
pub fn parse_http_date(value: &str) -> Result<OffsetDateTime> {
    PrimitiveDateTime::parse(value.trim(), HTTP_DATE)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|e| StoreError::InvalidArgument(format!("bad HTTP date {value:?}: {e}")))
}

#[derive(Debug, PartialEq, Eq)]
enum EntityTag<'a> {
    Any,
    Opaque(&'a str),
}

/// Parse an `If-None-Match` list. Weak tags compare by their opaque part.
fn parse_entity_tags(value: &str) -> Result<Vec<EntityTag<'_>>> {
    let bad = || StoreError::InvalidArgument(format!("bad entity tag list: {value:?}"));

    if value.trim() == "*" {
        return Ok(vec![EntityTag::Any]);
    }

    let mut tags = Vec::new();
    for item in value.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let item = item.strip_prefix("W/").unwrap_or(item);
        let opaque = item
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
            .ok_or_else(bad)?;
        if opaque.contains('"') {
            return Err(bad());
        }
        tags.push(EntityTag::Opaque(opaque));
    }

    if tags.is_empty() {
        return Err(bad());
    }
    Ok(tags)
}
