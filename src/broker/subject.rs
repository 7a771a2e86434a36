//! Dot-segmented subject names and wildcard matching
//!
//! Subscription patterns support `*` (exactly one segment) and `>` (one or
//! more trailing segments). Publish subjects must be literal.

/// True if `subject` is a valid literal subject for publishing.
pub fn valid_subject(subject: &str) -> bool {
    !subject.is_empty()
        && subject
            .split('.')
            .all(|seg| !seg.is_empty() && seg != "*" && seg != ">")
}

/// True if `pattern` is a valid subscription pattern.
pub fn valid_pattern(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let segments: Vec<&str> = pattern.split('.').collect();
    for (i, seg) in segments.iter().enumerate() {
        if seg.is_empty() {
            return false;
        }
        if *seg == ">" && i != segments.len() - 1 {
            return false;
        }
    }
    true
}

/// Matches a literal subject against a subscription pattern.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');

    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
