//! Hostname grammar for served sites.

use once_cell::sync::Lazy;
use regex::Regex;

/// Longest hostname we accept, per RFC 1035.
const MAX_DOMAIN_LEN: usize = 253;

/// Labels of alphanumerics/hyphens with non-hyphen boundaries, at least two
/// segments, and a purely alphabetic TLD of two or more characters.
static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?)*\.[a-zA-Z]{2,}$",
    )
    .expect("domain regex is valid")
});

/// Whether `domain` is an acceptable site hostname.
pub fn validate_domain(domain: &str) -> bool {
    domain.len() <= MAX_DOMAIN_LEN
        && domain.split('.').all(|label| label.len() <= 63)
        && DOMAIN_RE.is_match(domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_domains() {
        assert!(validate_domain("example.com"));
        assert!(validate_domain("sub.example.com"));
        assert!(validate_domain("a.b.c.example.io"));
        assert!(validate_domain("my-site.example.com"));
        assert!(validate_domain("0day.example.net"));
    }

    #[test]
    fn test_invalid_domains() {
        assert!(!validate_domain("not a domain"));
        assert!(!validate_domain("nodots"));
        assert!(!validate_domain("example."));
        assert!(!validate_domain(".example.com"));
        assert!(!validate_domain("-leading.example.com"));
        assert!(!validate_domain("trailing-.example.com"));
        assert!(!validate_domain("example.c"));
        assert!(!validate_domain("example.c0m"));
        assert!(!validate_domain("exa_mple.com"));
        assert!(!validate_domain(""));
    }

    #[test]
    fn test_length_limits() {
        let long_label = format!("{}.com", "a".repeat(64));
        assert!(!validate_domain(&long_label));

        let ok_label = format!("{}.com", "a".repeat(63));
        assert!(validate_domain(&ok_label));

        let long_domain = format!("{}.com", "a.".repeat(130));
        assert!(!validate_domain(&long_domain));
    }
}
