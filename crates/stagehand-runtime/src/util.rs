use rand::distributions::Alphanumeric;
use rand::Rng;

/// Generate a random alphanumeric worker name.
pub(crate) fn random_name(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Current wall-clock time as unix nanoseconds, the heartbeat wire format.
pub(crate) fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// HTML-escape a request path before it is used as a task id.
///
/// Escapes the same five characters that endpoint ids are stored with, so
/// lookups and seeded records agree on the key.
pub(crate) fn escape_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
