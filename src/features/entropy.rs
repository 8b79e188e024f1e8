//! # Entropy Scorer
//!
//! Information density of free-text fields. Obfuscated or encoded command
//! lines (base64 blobs, random names) carry more bits per character than
//! ordinary ones.

use std::collections::HashMap;

/// Shannon entropy in bits per character.
///
/// Empty or absent text scores 0.0.
pub fn shannon_entropy(text: Option<&str>) -> f64 {
    let Some(text) = text else {
        return 0.0;
    };

    let mut counts: HashMap<char, usize> = HashMap::new();
    let mut total = 0usize;
    for c in text.chars() {
        *counts.entry(c).or_insert(0) += 1;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }

    let n = total as f64;
    counts
        .values()
        .map(|&count| {
            let p = count as f64 / n;
            -p * p.log2()
        })
        .sum()
}

/// Mean Shannon entropy of the non-empty tokens.
pub fn avg_token_entropy<'a, I>(tokens: I) -> f64
where
    I: IntoIterator<Item = &'a str>,
{
    let mut sum = 0.0;
    let mut count = 0usize;
    for token in tokens.into_iter().filter(|t| !t.is_empty()) {
        sum += shannon_entropy(Some(token));
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Pick the most informative text available: the primary field when it has
/// content, otherwise the fallback.
pub fn informative_text<'a>(primary: Option<&'a str>, fallback: Option<&'a str>) -> Option<&'a str> {
    primary
        .filter(|s| !s.trim().is_empty())
        .or_else(|| fallback.filter(|s| !s.trim().is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_has_zero_entropy() {
        assert_eq!(shannon_entropy(None), 0.0);
        assert_eq!(shannon_entropy(Some("")), 0.0);
        assert_eq!(shannon_entropy(Some("aaaa")), 0.0);
    }

    #[test]
    fn test_uniform_alphabet_entropy() {
        assert!((shannon_entropy(Some("ab")) - 1.0).abs() < 1e-12);
        assert!((shannon_entropy(Some("abcd")) - 2.0).abs() < 1e-12);
        assert!((shannon_entropy(Some("abcdefgh")) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_encoded_command_scores_higher() {
        let plain = shannon_entropy(Some("ping ping ping"));
        let encoded = shannon_entropy(Some("powershell -enc SQBFAFgAIAAoAE4AZQB3AC0ATwBiAGoA"));
        assert!(encoded > plain);
    }

    #[test]
    fn test_avg_token_entropy_ignores_empty_tokens() {
        let avg = avg_token_entropy(["ab", "", "abcd"]);
        assert!((avg - 1.5).abs() < 1e-12);
        assert_eq!(avg_token_entropy(Vec::<&str>::new()), 0.0);
    }

    #[test]
    fn test_informative_text_falls_back() {
        assert_eq!(informative_text(Some("cmd.exe /c"), Some("msg")), Some("cmd.exe /c"));
        assert_eq!(informative_text(None, Some("msg")), Some("msg"));
        assert_eq!(informative_text(Some("  "), Some("msg")), Some("msg"));
        assert_eq!(informative_text(None, None), None);
    }
}
