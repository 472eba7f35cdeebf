//! Domain and list-ID helpers.

use std::collections::{BTreeSet, HashSet};

/// Expand a domain into its suffix-anchored sub-domain ladder.
///
/// `a.b.example.com` becomes `a.b.example.com`, `b.example.com` and
/// `example.com`. The ladder never goes past the public suffix, so a domain
/// that only consists of a registrable label plus suffix yields itself.
/// Rungs are lowercase.
pub fn split_domain(domain: &str) -> Vec<String> {
    let domain = domain.trim_matches('.').to_ascii_lowercase();
    let domain = domain.as_str();
    if domain.is_empty() {
        return Vec::new();
    }

    let suffix = match psl::suffix_str(domain) {
        Some(suffix) if suffix != domain => suffix,
        _ => return vec![domain.to_string()],
    };

    let without_suffix = domain[..domain.len() - suffix.len()].trim_matches('.');
    let labels: Vec<&str> = without_suffix.split('.').filter(|l| !l.is_empty()).collect();
    if labels.is_empty() {
        return vec![domain.to_string()];
    }

    (0..labels.len())
        .map(|idx| format!("{}.{}", labels[idx..].join("."), suffix))
        .collect()
}

/// Deduplicate while keeping the first occurrence of each value.
pub fn make_distinct(values: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(values.len());
    values
        .into_iter()
        .filter(|v| seen.insert(v.clone()))
        .collect()
}

/// Union of two list-ID sets, sorted and deduplicated.
pub fn merge_sorted(existing: &[String], new: &[String]) -> Vec<String> {
    existing
        .iter()
        .chain(new.iter())
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
