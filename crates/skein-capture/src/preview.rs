pub const DEFAULT_PREVIEW_BYTES: usize = 2 * 1024;

/// Cut `text` to at most `max_bytes` on a char boundary, appending a marker
/// with the original and kept sizes when anything was dropped.
pub fn preview(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_owned();
    }
    let mut boundary = max_bytes;
    while !text.is_char_boundary(boundary) {
        boundary -= 1;
    }
    format!(
        "{}\n[truncated: {} bytes -> {} bytes]",
        &text[..boundary],
        text.len(),
        boundary
    )
}
