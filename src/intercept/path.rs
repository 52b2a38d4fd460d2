//! URL normalization and path-template matching.

/// Reduce a URL or path to the bare path used for matching.
///
/// Scheme and authority, query string, fragment and trailing slash are
/// dropped. The result always starts with `/`.
pub fn normalize_path(url: &str) -> String {
    let mut rest = url.trim();
    if let Some(idx) = rest.find("://") {
        rest = &rest[idx + 3..];
        rest = match rest.find('/') {
            Some(slash) => &rest[slash..],
            None => "",
        };
    }
    if let Some(end) = rest.find(['?', '#']) {
        rest = &rest[..end];
    }

    let trimmed = rest.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// True when `path` (already normalized) fits `template`.
///
/// Literal segments must be equal; a `{name}` segment matches any non-empty
/// segment.
pub fn path_matches_template(template: &str, path: &str) -> bool {
    let template = normalize_path(template);
    let mut template_segments = template.split('/');
    let mut path_segments = path.split('/');

    loop {
        match (template_segments.next(), path_segments.next()) {
            (None, None) => return true,
            (Some(expected), Some(actual)) => {
                if is_template_param(expected) {
                    if actual.is_empty() {
                        return false;
                    }
                } else if expected != actual {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

fn is_template_param(segment: &str) -> bool {
    segment.len() > 2 && segment.starts_with('{') && segment.ends_with('}')
}
