//! Fuzzy text scoring for `search`.
//!
//! A record scores the best normalized Levenshtein ratio between the query
//! and any of its textual leaves (or any whitespace-separated word in them),
//! compared case-insensitively. Ratios lie in `[0, 1]`, where `1` is an exact
//! match.

use serde_json::Value;

/// Levenshtein edit distance over Unicode scalar values.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }

    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut diagonal = row[0];
        row[0] = i.saturating_add(1);
        for (j, cb) in b.iter().enumerate() {
            let substitution = diagonal.saturating_add(usize::from(ca != cb));
            let insertion = row[j].saturating_add(1);
            let deletion = row[j.saturating_add(1)].saturating_add(1);
            diagonal = row[j.saturating_add(1)];
            row[j.saturating_add(1)] = substitution.min(insertion).min(deletion);
        }
    }
    row[b.len()]
}

/// `1 - distance / max_len`; two empty strings are identical.
#[allow(clippy::cast_precision_loss)]
pub fn ratio(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / longest as f64
}

fn collect_text(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.to_lowercase()),
        Value::Number(n) => out.push(n.to_string()),
        Value::Bool(b) => out.push(b.to_string()),
        Value::Array(items) => items.iter().for_each(|v| collect_text(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_text(v, out)),
        Value::Null => {},
    }
}

/// Best similarity between `query` and the textual content of `record`.
pub fn score(record: &Value, query: &str) -> f64 {
    let query = query.trim().to_lowercase();
    let mut leaves = Vec::new();
    collect_text(record, &mut leaves);

    leaves
        .iter()
        .flat_map(|leaf| {
            std::iter::once(ratio(&query, leaf))
                .chain(leaf.split_whitespace().map(|word| ratio(&query, word)))
        })
        .fold(0.0, f64::max)
}
