//! Filename sanitization for model- or user-supplied name components.

/// Make `name` safe to use as a single path component.
///
/// Path separators, `:` and NUL become `_`, any `..` collapses to `_`, and
/// leading/trailing dots and whitespace are stripped. Never returns an empty
/// string.
pub fn sanitize_filename_component(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            other => other,
        })
        .collect();
    let collapsed = replaced.replace("..", "_");
    let trimmed = collapsed.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}
