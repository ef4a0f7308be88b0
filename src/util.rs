/// Utility helpers used across the collector.
///
/// This module contains:
/// - Tag normalization helpers
/// - Time helpers
///
/// IMPORTANT:
/// - No endpoint-specific business logic should live here.
/// - This module must remain lightweight and deterministic.
///

use chrono::{DateTime, Utc};

/// Normalize a player / clan / war tag into the canonical upstream format.
///
/// Target format:
///     #TAG (uppercase, single leading '#')
///
/// Examples:
/// - "2pp"      -> "#2PP"
/// - " #2pp "   -> "#2PP"
/// - "%232PP"   -> "#2PP"
///
/// DESIGN NOTES:
/// - Tags copied from browser URLs arrive percent-encoded.
/// - Encoding for the request path happens in the API client, not here.
///
pub fn normalize_tag(raw: &str) -> String {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("%23")
        .or_else(|| trimmed.strip_prefix('#'))
        .unwrap_or(trimmed);

    format!("#{}", body.to_uppercase())
}

/// Returns the current wall-clock time in UTC.
///
/// Used to stamp every snapshot with its observation time.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Truncate a string to at most `max` characters (not bytes).
pub fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_adds_prefix_and_uppercases() {
        assert_eq!(normalize_tag("2pp"), "#2PP");
        assert_eq!(normalize_tag("  #2pp "), "#2PP");
    }

    #[test]
    fn normalize_decodes_url_prefix() {
        assert_eq!(normalize_tag("%232PP"), "#2PP");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("#ABC_20240101T000000.000Z", 4), "#ABC");
        assert_eq!(truncate_chars("ab", 10), "ab");
    }
}
