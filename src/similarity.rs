//! Tokenize + Jaccard + fingerprint hash for duplicate-content detection.

use std::collections::HashSet;

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

fn url_pattern() -> &'static Regex {
    static URL: OnceLock<Regex> = OnceLock::new();
    URL.get_or_init(|| Regex::new(r"https?://\S+").expect("valid regex"))
}

/// Default similarity threshold used by `TooSimilar`.
pub const SIMILARITY_THRESHOLD: f64 = 0.86;

/// Lowercases, strips URLs, drops `@`/`#`, folds every non-alphanumeric char to whitespace,
/// and keeps tokens of length >= 2, joined by a single space.
pub fn normalize(s: &str) -> String {
    let lowered = s.to_lowercase();
    let without_urls = url_pattern().replace_all(&lowered, " ");
    let without_markers = without_urls.replace(['@', '#'], "");

    let folded: String = without_markers
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    folded
        .split_whitespace()
        .filter(|tok| tok.chars().count() >= 2)
        .collect::<Vec<_>>()
        .join(" ")
}

/// `hex(SHA-256(normalize(s)))[:24]`.
pub fn fingerprint(s: &str) -> String {
    let normalized = normalize(s);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..24].to_string()
}

fn token_set(s: &str) -> HashSet<String> {
    normalize(s).split(' ').filter(|t| !t.is_empty()).map(str::to_string).collect()
}

/// Jaccard similarity over token sets. Either side being empty yields 0.
pub fn similarity(a: &str, b: &str) -> f64 {
    let set_a = token_set(a);
    let set_b = token_set(b);
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

/// `∃ x ∈ corpus. similarity(candidate, x) >= threshold`.
pub fn too_similar<'a>(
    candidate: &str,
    corpus: impl IntoIterator<Item = &'a str>,
    threshold: f64,
) -> bool {
    corpus.into_iter().any(|existing| similarity(candidate, existing) >= threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_urls_markers_and_short_tokens() {
        let normalized = normalize("Check this out https://example.com/x @someone #rust! a ok");
        assert_eq!(normalized, "check this out someone rust ok");
    }

    #[test]
    fn similarity_is_symmetric() {
        let a = "Focus on clarity first.";
        let b = "Ship small, focus on clarity.";
        assert_eq!(similarity(a, b), similarity(b, a));
    }

    #[test]
    fn similarity_of_a_with_itself_is_one() {
        let a = "The quick brown fox jumps";
        assert_eq!(similarity(a, a), 1.0);
    }

    #[test]
    fn empty_side_yields_zero() {
        assert_eq!(similarity("", "anything here"), 0.0);
        assert_eq!(similarity("###", "anything here"), 0.0);
    }

    #[test]
    fn too_similar_detects_near_duplicates_after_normalization() {
        let corpus = vec!["Focus on clarity first.".to_string()];
        let corpus_refs: Vec<&str> = corpus.iter().map(String::as_str).collect();
        assert!(too_similar(
            "focus on Clarity first!",
            corpus_refs.iter().copied(),
            SIMILARITY_THRESHOLD
        ));
    }

    #[test]
    fn fingerprint_is_deterministic_and_24_hex_chars() {
        let fp1 = fingerprint("Some post body https://t.co/abc");
        let fp2 = fingerprint("some POST body https://t.co/abc");
        assert_eq!(fp1, fp2);
        assert_eq!(fp1.len(), 24);
        assert!(fp1.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
