//! Hierarchical path helpers.
//!
//! Paths use `/` as separator and may or may not start with `/`
//! (`/content/a` and `a:alice/public` are both valid).

/// Parent of `path`, or `None` for a top-level segment or the root.
pub fn parent_path(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}

/// `path` followed by every ancestor, nearest first.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut result = Vec::new();
    if path.is_empty() {
        return result;
    }
    result.push(path.to_string());
    let mut current = path;
    while let Some(parent) = parent_path(current) {
        result.push(parent.to_string());
        current = parent;
    }
    result
}
