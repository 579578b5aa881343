use std::borrow::Cow;

/// Extracts a normalized extension from a path or file name.
///
/// Returns the extension in lowercase without the dot (e.g. "rs"), or
/// `None` for names without a valid extension. Dotfiles such as `.env`
/// report their name as the extension.
///
/// An extension is considered valid if it:
/// - Is non-empty
/// - Is at most 10 characters long
/// - Does not contain '/'
pub fn extension_of(path: &str) -> Option<Cow<'_, str>> {
    let file_name = file_name(path);
    match file_name.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() && ext.len() <= 10 && !ext.contains('/') => {
            if ext.bytes().any(|b| b.is_ascii_uppercase()) {
                Some(Cow::Owned(ext.to_ascii_lowercase()))
            } else {
                Some(Cow::Borrowed(ext))
            }
        }
        _ => None,
    }
}

/// Last path component
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Make an arbitrary string safe to use as one path segment
pub fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" => "_".to_string(),
        "." | ".." => cleaned.replace('.', "_"),
        _ => cleaned,
    }
}
