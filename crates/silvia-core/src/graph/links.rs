//! Wiki-link discovery in free-form content

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// Matches `[[target]]` and `[[target|label]]`; only the target is captured.
pub(crate) static WIKI_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[([^\]|]+)(?:\|[^\]]+)?\]\]").unwrap());

/// Extract all wiki-link targets from content.
///
/// Output preserves first-occurrence order and is deduplicated.
pub fn extract_wiki_links(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for captures in WIKI_LINK.captures_iter(content) {
        let target = captures[1].to_string();
        if seen.insert(target.clone()) {
            links.push(target);
        }
    }
    links
}

/// Rewrite wiki-links targeting `old` to target `new`, keeping labels.
///
/// `[[old]]` becomes `[[new]]` and `[[old|label]]` becomes `[[new|label]]`;
/// links to other targets are untouched.
pub fn rewrite_wiki_links(content: &str, old: &str, new: &str) -> String {
    WIKI_LINK
        .replace_all(content, |caps: &regex::Captures<'_>| {
            if &caps[1] == old {
                let full = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
                match full.find('|') {
                    Some(pipe) => format!("[[{}{}", new, &full[pipe..]),
                    None => format!("[[{new}]]"),
                }
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}
