//! HTTP response retryability classification used by the Query service
//! client before handing a failure to the retry supervisor (spec §4.9).

/// Whether an HTTP response is worth retrying, given its status and body.
/// The body heuristics only look at a handful of substrings — spec §9 notes
/// this is weaker than a structured error channel, but is what the source
/// protocol exposes today.
pub fn is_retryable(status: u16, body: &str) -> bool {
    match status {
        200..=299 => false,
        300..=303 | 307 => true,
        408 | 409 | 412 | 416 | 417 | 502 | 503 | 504 => true,
        404 => !names_missing_resource(body),
        500 => !names_missing_view(body),
        _ => false,
    }
}

fn names_missing_resource(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    let has_not_found_marker = lower.contains("not found") || lower.contains("not_found");
    has_not_found_marker && (lower.contains("missing") || lower.contains("deleted"))
}

fn names_missing_view(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("missing named view") || lower.contains("missing_named_view")
}
