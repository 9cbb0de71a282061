/// Default maximum length for fingerprints and examples.
pub const DEFAULT_MAX_QUERY_LENGTH: i32 = 4096;

/// Appended to truncated text.
pub const TRUNCATION_MARKER: &str = " ...";

/// Cut `query` to at most `max_len` characters, marker included.
///
/// `max_len == 0` selects [`DEFAULT_MAX_QUERY_LENGTH`]; a negative value
/// disables truncation. Limits too short to hold the marker get a plain
/// prefix. Returns the text and whether it was cut.
pub fn query(query: &str, max_len: i32) -> (String, bool) {
    let limit = match max_len {
        l if l < 0 => return (query.to_string(), false),
        0 => DEFAULT_MAX_QUERY_LENGTH as usize,
        l => l as usize,
    };

    if query.chars().count() <= limit {
        return (query.to_string(), false);
    }

    let marker_len = TRUNCATION_MARKER.chars().count();
    if limit <= marker_len {
        return (query.chars().take(limit).collect(), true);
    }

    let mut out: String = query.chars().take(limit - marker_len).collect();
    out.push_str(TRUNCATION_MARKER);
    (out, true)
}
