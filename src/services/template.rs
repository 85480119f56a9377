//! Destination-key template resolution.

use std::collections::BTreeMap;

/// Substitute every occurrence of every key of `values` in `template`.
///
/// Resolution is a single left-to-right pass: substituted values are never
/// rescanned. At each position the earliest match wins, and on a tie the
/// longest key. Tokens absent from `values` are left untouched.
pub fn resolve(template: &str, values: &BTreeMap<String, String>) -> String {
    let mut resolved = String::with_capacity(template.len());
    let mut rest = template;

    while !rest.is_empty() {
        let next = values
            .iter()
            .filter(|(token, _)| !token.is_empty())
            .filter_map(|(token, value)| rest.find(token.as_str()).map(|pos| (pos, token.len(), value)))
            .min_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));

        match next {
            Some((pos, len, value)) => {
                resolved.push_str(&rest[..pos]);
                resolved.push_str(value);
                rest = &rest[pos + len..];
            }
            None => {
                resolved.push_str(rest);
                break;
            }
        }
    }

    resolved
}
