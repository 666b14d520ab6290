// src/dedup/lexical.rs
//! Cheap lexical similarity used to gate the expensive semantic judge.
//!
//! Turkish morphology fragments naive tokenization ("depremde" vs
//! "deprem"), so titles get a light suffix-stripping pass before the
//! Jaccard comparison, and the prefilter threshold is deliberately low.

use std::collections::HashSet;

/// Agglutinative suffixes stripped from title tokens. Ordered longest
/// first; any match leaving at least two characters is stripped once.
const TURKISH_SUFFIXES: &[&str] = &[
    "larından", "lerinden", "larında", "lerinde", "ların", "lerin", "lardan", "lerden", "larda",
    "lerde", "lara", "lere", "ları", "leri", "lar", "ler", "ndan", "nden", "nda", "nde", "dan",
    "den", "tan", "ten", "da", "de", "ta", "te", "nın", "nin", "nun", "nün", "ın", "in", "un",
    "ün", "sı", "si", "su", "sü", "ya", "ye", "yı", "yi", "yu", "yü", "ı", "i", "u", "ü", "a",
    "e",
];

/// Lowercase, keep alphanumeric runs, drop tokens shorter than 3 chars,
/// stem tokens of 4+ chars.
pub fn stem_tokens(title: &str) -> HashSet<String> {
    title
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 3)
        .map(strip_suffix_once)
        .collect()
}

fn strip_suffix_once(token: &str) -> String {
    let len = token.chars().count();
    if len < 4 {
        return token.to_string();
    }
    for suffix in TURKISH_SUFFIXES {
        let suffix_len = suffix.chars().count();
        if len >= suffix_len + 2 {
            if let Some(stripped) = token.strip_suffix(suffix) {
                return stripped.to_string();
            }
        }
    }
    token.to_string()
}

/// Jaccard similarity over stemmed title tokens. Empty-union pairs score 0.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let sa = stem_tokens(a);
    let sb = stem_tokens(b);
    if sa.is_empty() && sb.is_empty() {
        return 0.0;
    }
    let intersection = sa.intersection(&sb).count();
    let union = sa.union(&sb).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Normalization used by the backfill exact-title pass: lowercase, strip
/// punctuation, collapse whitespace.
pub fn normalize_title(title: &str) -> String {
    let lowered = title.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut prev_space = false;
    for ch in lowered.chars() {
        if ch.is_alphanumeric() {
            out.push(ch);
            prev_space = false;
        } else if !prev_space && !out.is_empty() {
            out.push(' ');
            prev_space = true;
        } else {
            prev_space = true;
        }
    }
    out.trim_end().to_string()
}
