//! Topic matching
//!
//! Topics and topic filters are `/`-separated segments. In a filter, the
//! segment `*` matches exactly one topic segment and `#` matches whatever is
//! left of the topic (including nothing); `#` is only valid as the final
//! segment. Wildcard characters are never part of a literal segment.
//!
//! `matches` is total: a malformed filter simply matches nothing. Filters are
//! rejected up front by `validate_filter` when a client subscribes.

pub const SEPARATOR: char = '/';
pub const SINGLE_LEVEL: &str = "*";
pub const MULTI_LEVEL: &str = "#";

/// True if `topic` is a well-formed publish topic: non-empty and free of
/// wildcard characters.
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['*', '#', '\0'])
}

/// Check filter syntax. Returns the offending filter on error so callers can
/// wrap it in their own error type.
pub fn validate_filter(filter: &str) -> Result<(), &str> {
    if filter.is_empty() || filter.contains('\0') {
        return Err(filter);
    }

    let mut segments = filter.split(SEPARATOR).peekable();
    while let Some(segment) = segments.next() {
        let is_last = segments.peek().is_none();
        match segment {
            SINGLE_LEVEL => {}
            MULTI_LEVEL if is_last => {}
            MULTI_LEVEL => return Err(filter),
            literal if literal.contains(['*', '#']) => return Err(filter),
            _ => {}
        }
    }
    Ok(())
}

pub fn is_valid_filter(filter: &str) -> bool {
    validate_filter(filter).is_ok()
}

/// Decide whether `topic` is matched by `filter`.
pub fn matches(topic: &str, filter: &str) -> bool {
    if !is_valid_topic(topic) || !is_valid_filter(filter) {
        return false;
    }

    let mut topic_segments = topic.split(SEPARATOR);
    for filter_segment in filter.split(SEPARATOR) {
        if filter_segment == MULTI_LEVEL {
            // validated above: `#` is always the last filter segment
            return true;
        }
        match topic_segments.next() {
            Some(_) if filter_segment == SINGLE_LEVEL => {}
            Some(segment) if segment == filter_segment => {}
            _ => return false,
        }
    }

    // filter exhausted: only a match if the topic is exhausted too
    topic_segments.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_filters_match_exactly() {
        assert!(matches("x/y", "x/y"));
        assert!(!matches("x/y", "x/z"));
        assert!(!matches("Test", "test"));
        assert!(!matches("x/y/z", "x/y"));
        assert!(!matches("x", "x/y"));
    }

    #[test]
    fn single_level_wildcard() {
        assert!(matches("a/b/c", "a/*/c"));
        assert!(!matches("a/b/c", "a/*"));
        assert!(matches("a/b", "a/*"));
        assert!(!matches("a", "a/*"));
        assert!(matches("a//c", "a/*/c"));
        assert!(matches("a", "*"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(matches("a/b/c", "a/#"));
        assert!(matches("a", "a/#"));
        assert!(matches("a/b", "a/#"));
        assert!(matches("anything/at/all", "#"));
        assert!(matches("a/b/c/d", "a/*/#"));
        assert!(!matches("b/c", "a/#"));
    }

    #[test]
    fn malformed_filters_never_match() {
        assert!(!matches("a/b", "a/#/b"));
        assert!(!matches("a/b", "a/b#"));
        assert!(!matches("a/b", "a*/b"));
        assert!(!matches("a/b", ""));
    }

    #[test]
    fn wildcards_in_topics_never_match() {
        assert!(!matches("a/*", "a/*"));
        assert!(!matches("a/#", "#"));
        assert!(!matches("", "#"));
    }

    #[test]
    fn filter_validation() {
        assert!(is_valid_filter("a/b"));
        assert!(is_valid_filter("*"));
        assert!(is_valid_filter("#"));
        assert!(is_valid_filter("a/*/#"));
        assert_eq!(validate_filter("a/#/b"), Err("a/#/b"));
        assert!(!is_valid_filter("a/b*"));
        assert!(!is_valid_filter("a/##"));
        assert!(!is_valid_filter(""));
    }

    #[test]
    fn topic_validation() {
        assert!(is_valid_topic("my/topic1"));
        assert!(!is_valid_topic(""));
        assert!(!is_valid_topic("a/*"));
        assert!(!is_valid_topic("a/#"));
    }
}
