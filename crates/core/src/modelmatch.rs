//! Restricted model-name pattern matcher for route/model-mapping filters.
//!
//! Unlike [`crate::glob::glob_match`] (a general multi-star matcher kept for
//! `AuthRecord` model-list filtering), route-level model mapping patterns are
//! deliberately restricted to four shapes: an exact string, a `prefix*`, a
//! `*suffix`, or a `*infix*`. No other wildcard placement or multi-star
//! pattern is recognized — such patterns are treated as literal strings and
//! will simply fail to match anything but themselves.

/// Match `text` against a restricted pattern: `exact`, `prefix*`, `*suffix`,
/// or `*infix*`. A pattern with a `*` anywhere other than as a single leading
/// and/or trailing character falls back to literal (exact) comparison.
pub fn matches(pattern: &str, text: &str) -> bool {
    let starts = pattern.starts_with('*');
    let ends = pattern.ends_with('*');

    match (starts, ends) {
        (false, false) => pattern == text,
        (false, true) => {
            let prefix = &pattern[..pattern.len() - 1];
            !prefix.contains('*') && text.starts_with(prefix)
        }
        (true, false) => {
            let suffix = &pattern[1..];
            !suffix.contains('*') && text.ends_with(suffix)
        }
        (true, true) => {
            if pattern.len() < 2 {
                // pattern is just "*"
                return true;
            }
            let infix = &pattern[1..pattern.len() - 1];
            !infix.contains('*') && (infix.is_empty() || text.contains(infix))
        }
    }
}

/// True if any pattern in `patterns` matches `text`. An empty pattern list
/// matches nothing.
pub fn matches_any<'a>(patterns: impl IntoIterator<Item = &'a str>, text: &str) -> bool {
    patterns.into_iter().any(|p| matches(p, text))
}

/// The request-scoped facts a [`crate::config::ModelMappingRule`]'s scope
/// filters are checked against. A rule filter of `None` matches any value
/// here; a rule filter of `Some(x)` requires the corresponding field to
/// equal `x` exactly (scope filters are never glob patterns themselves).
pub struct MappingScope<'a> {
    pub client_type: &'a str,
    pub provider_type: &'a str,
    pub provider_id: &'a str,
}

/// Resolve the mapped upstream model name for `requested_model` under
/// `scope`, given `rules` already sorted highest-priority-first (as
/// `Config::sanitize` leaves them). Returns `None` when no rule applies,
/// meaning the caller should fall back to the original model name.
pub fn resolve_mapped_model(
    rules: &[crate::config::ModelMappingRule],
    scope: &MappingScope<'_>,
    requested_model: &str,
) -> Option<String> {
    rules
        .iter()
        .find(|rule| {
            scope_matches(rule.client_type.as_deref(), scope.client_type)
                && scope_matches(rule.provider_type.as_deref(), scope.provider_type)
                && scope_matches(rule.provider_id.as_deref(), scope.provider_id)
                && matches(&rule.pattern, requested_model)
        })
        .map(|rule| rule.target.clone())
}

fn scope_matches(filter: Option<&str>, actual: &str) -> bool {
    filter.is_none_or(|f| f == actual)
}
