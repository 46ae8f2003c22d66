//! Target canonicalization
//!
//! An access target is whatever URL a browsing surface is trying to reach.
//! The monitoring key is its host with a single mobile/www prefix label
//! removed, so `https://m.youtube.com/watch?v=abc` and `youtube.com` land on
//! the same key.

use url::Url;

use crate::{GatehouseError, ItemId, MonitorKey, Result};

/// Leading host labels that do not distinguish one destination from another.
const IGNORED_HOST_PREFIXES: &[&str] = &["www.", "m.", "mobile."];

fn parse_target(target: &str) -> Result<Url> {
    let trimmed = target.trim();
    if trimmed.is_empty() {
        return Err(GatehouseError::invalid_target("empty target"));
    }

    match Url::parse(trimmed) {
        Ok(url) if url.host_str().is_some() => Ok(url),
        // `youtube.com:443` parses with `youtube.com` as the scheme
        Ok(_) | Err(url::ParseError::RelativeUrlWithoutBase) if !trimmed.contains("://") => {
            Url::parse(&format!("https://{trimmed}"))
                .map_err(|e| GatehouseError::invalid_target(format!("{trimmed}: {e}")))
        }
        Ok(_) => Err(GatehouseError::invalid_target(format!("{trimmed}: no host"))),
        Err(e) => Err(GatehouseError::invalid_target(format!("{trimmed}: {e}"))),
    }
}

fn strip_ignored_prefix(host: &str) -> &str {
    let host = host.trim_end_matches('.');
    for prefix in IGNORED_HOST_PREFIXES {
        if let Some(rest) = host.strip_prefix(prefix) {
            if !rest.is_empty() {
                return rest;
            }
        }
    }
    host
}

/// Derive the monitoring key for a target URL or bare domain.
pub fn canonicalize_target(target: &str) -> Result<MonitorKey> {
    let url = parse_target(target)?;
    let host = url
        .host_str()
        .ok_or_else(|| GatehouseError::invalid_target(format!("{target}: no host")))?;

    let key = strip_ignored_prefix(host);
    if key.is_empty() {
        return Err(GatehouseError::invalid_target(format!("{target}: empty host")));
    }

    Ok(MonitorKey::new(key.to_ascii_lowercase()))
}

fn is_youtube_host(key: &str) -> bool {
    key == "youtube.com" || key.ends_with(".youtube.com") || key == "youtu.be"
}

/// Extract the item identifier (a video id) from a target, if it carries one.
///
/// Recognized forms: `/shorts/<id>`, `?v=<id>`, and `youtu.be/<id>`.
pub fn extract_item_id(target: &str) -> Option<ItemId> {
    let url = parse_target(target).ok()?;
    let key = strip_ignored_prefix(url.host_str()?).to_ascii_lowercase();
    if !is_youtube_host(&key) {
        return None;
    }

    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
    let id = match segments.next() {
        Some("shorts") => segments.next().map(str::to_string),
        Some(first) if key == "youtu.be" => Some(first.to_string()),
        _ => url
            .query_pairs()
            .find(|(name, _)| name == "v")
            .map(|(_, value)| value.into_owned()),
    };

    id.filter(|id| !id.is_empty()).map(ItemId::new)
}
