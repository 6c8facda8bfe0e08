//! Helpers for sanitizing data before it enters log lines or span attributes.
//!
//! Media keys can embed tenant and participant names, and signed read URLs
//! carry a bearer token in the query string. Neither may reach the logs.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Returns only the last path segment of a media storage key.
pub fn redact_media_ref(media_ref: &str) -> String {
    media_ref
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Drops the query string and fragment from a URL.
///
/// - `https://cdn/x.mp3?token=abc` → `https://cdn/x.mp3?****`
/// - `https://cdn/x.mp3` → unchanged
pub fn redact_url(url: &str) -> String {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    if end == url.len() {
        return url.to_string();
    }
    format!("{}?****", &url[..end])
}

/// Truncates free-form provider text so a runaway error body cannot flood the
/// log or the `last_error` column.
pub fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}... (truncated)", &text[..idx]),
        None => text.to_string(),
    }
}

/// Short deterministic hash for correlating a value without exposing it.
pub fn hash_value(value: &str) -> String {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
