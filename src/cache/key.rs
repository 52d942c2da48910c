//! Key sanitization
//!
//! Keys and namespaces become file and directory names in the persistent
//! tier, so they are reduced to `[A-Za-z0-9_.-]` before use.

use crate::error::CacheError;

/// Longest sanitized key or namespace, in bytes
pub const MAX_KEY_LEN: usize = 200;

/// Maps `raw` onto a storage-safe name
///
/// - characters outside `[A-Za-z0-9_.-]` become `_`
/// - runs of dots collapse to a single `.` so `..` can never appear
/// - leading dots are dropped (no hidden files, no `.`)
/// - the result is capped at [`MAX_KEY_LEN`]
///
/// The mapping is not injective. Raw keys that differ only in unsafe
/// characters share one stored entry: `KJFK/KLGA`, `KJFK:KLGA` and
/// `KJFK_KLGA` all name the same record. Callers that need them apart must
/// encode the difference with safe characters.
///
/// Returns [`CacheError::InvalidKey`] when nothing usable remains.
pub fn sanitize_key(raw: &str) -> Result<String, CacheError> {
    let mut out = String::with_capacity(raw.len().min(MAX_KEY_LEN));

    for c in raw.trim().chars() {
        let mapped = if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
            c
        } else {
            '_'
        };

        if mapped == '.' && (out.is_empty() || out.ends_with('.')) {
            continue;
        }
        out.push(mapped);

        if out.len() >= MAX_KEY_LEN {
            break;
        }
    }

    if out.is_empty() || out.chars().all(|c| c == '_') {
        return Err(CacheError::InvalidKey(raw.to_string()));
    }

    Ok(out)
}
