//! Small text helpers shared by the pipeline and broadcast payloads.

/// Strip HTML tags from content (basic) and normalize whitespace.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strip markup, collapse whitespace and truncate to at most `max` chars.
///
/// Used for the denormalized conversation `last_message` summary.
pub fn sanitize_and_truncate(content: &str, max: usize) -> String {
    let clean = strip_html(content);
    if clean.chars().count() <= max {
        return clean;
    }
    clean.chars().take(max).collect()
}

/// Replace filesystem-hostile characters in an attachment filename.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned
    }
}
