//! Host pattern matching
//!
//! Patterns are user supplied strings matched against a target `host` or
//! `host:port`. Literal labels must align one to one with the host labels;
//! a `*` matches any run of non-dot characters and may appear anywhere in
//! a label (`*host` matches `localhost` but not `my.host`). A port may
//! only be present on wildcard-free patterns. The single pattern `*`
//! matches every host and is the lowest priority match.

use crate::{Error, Result};

/// A parsed host pattern.
#[derive(Debug, Clone)]
pub struct HostPattern {
    raw: String,
    labels: Vec<String>,
    port: Option<u16>,
    wildcards: usize,
}

impl HostPattern {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::config("Empty host pattern"));
        }
        if trimmed.contains("://") || trimmed.contains('/') {
            return Err(Error::config(format!(
                "Host pattern must not contain a scheme or path: {}",
                trimmed
            )));
        }

        let (host_part, port) = match trimmed.rsplit_once(':') {
            Some((host, port_str)) if !port_str.is_empty() && port_str.bytes().all(|b| b.is_ascii_digit()) => {
                let port: u16 = port_str
                    .parse()
                    .map_err(|_| Error::config(format!("Invalid port in pattern: {}", trimmed)))?;
                (host, Some(port))
            }
            Some(_) => {
                return Err(Error::config(format!("Invalid port in pattern: {}", trimmed)));
            }
            None => (trimmed, None),
        };

        let wildcards = host_part.matches('*').count();
        if wildcards > 0 && port.is_some() {
            return Err(Error::config(format!(
                "Wildcard patterns must not carry a port: {}",
                trimmed
            )));
        }

        let labels: Vec<String> = host_part
            .split('.')
            .map(|l| l.to_ascii_lowercase())
            .collect();
        if labels.iter().any(|l| l.is_empty()) {
            return Err(Error::config(format!("Malformed host pattern: {}", trimmed)));
        }

        Ok(HostPattern {
            raw: trimmed.to_string(),
            labels,
            port,
            wildcards,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Case-insensitive identity used for overwrite-on-re-add.
    pub fn key(&self) -> String {
        self.raw.to_ascii_lowercase()
    }

    pub fn matches(&self, host: &str, port: u16) -> bool {
        if let Some(p) = self.port {
            if p != port {
                return false;
            }
        }

        // Bare "*" matches everything regardless of label count.
        if self.wildcards > 0 && self.labels.len() == 1 && self.labels[0] == "*" {
            return true;
        }

        let host = host.to_ascii_lowercase();
        let host_labels: Vec<&str> = host.split('.').collect();
        if host_labels.len() != self.labels.len() {
            return false;
        }

        self.labels
            .iter()
            .zip(host_labels.iter())
            .all(|(pat, label)| label_matches(pat, label))
    }

    pub fn has_port(&self) -> bool {
        self.port.is_some()
    }

    pub fn wildcard_count(&self) -> usize {
        self.wildcards
    }

    /// Length of the literal text after the last `*`, used for precedence.
    pub fn literal_suffix_len(&self) -> usize {
        match self.raw.rfind('*') {
            Some(idx) => self.raw.len() - idx - 1,
            None => self.raw.len(),
        }
    }
}

/// Single-label glob: `*` matches any run of characters within the label.
fn label_matches(pattern: &str, label: &str) -> bool {
    let pat = pattern.as_bytes();
    let text = label.as_bytes();

    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while t < text.len() {
        if p < pat.len() && (pat[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == b'*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == b'*' {
        p += 1;
    }
    p == pat.len()
}

/// Pick the winning pattern for `host:port` among all that match.
///
/// Precedence: exact `host:port`, then exact `host`, then the wildcard
/// pattern with the longest literal suffix (ties: fewer wildcards, then
/// lexicographic order).
pub fn best_match<'a, I>(patterns: I, host: &str, port: u16) -> Option<&'a HostPattern>
where
    I: IntoIterator<Item = &'a HostPattern>,
{
    let mut best: Option<(&HostPattern, (u8, usize, usize, String))> = None;

    for pattern in patterns {
        if !pattern.matches(host, port) {
            continue;
        }
        let tier: u8 = if pattern.wildcard_count() == 0 && pattern.has_port() {
            0
        } else if pattern.wildcard_count() == 0 {
            1
        } else {
            2
        };
        // Lower tuples win: tier, then shrinking suffix (inverted), then
        // wildcard count, then the lexicographic raw form.
        let rank = (
            tier,
            usize::MAX - pattern.literal_suffix_len(),
            pattern.wildcard_count(),
            pattern.key(),
        );
        match &best {
            Some((_, current)) if *current <= rank => {}
            _ => best = Some((pattern, rank)),
        }
    }

    best.map(|(p, _)| p)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pat(s: &str) -> HostPattern {
        HostPattern::parse(s).unwrap()
    }

    #[test]
    fn test_exact_match_case_insensitive() {
        assert!(pat("Example.COM").matches("example.com", 80));
        assert!(!pat("example.com").matches("example.org", 80));
    }

    #[test]
    fn test_port_semantics() {
        assert!(pat("host:8080").matches("host", 8080));
        assert!(!pat("host:8080").matches("host", 80));
        assert!(pat("host").matches("host", 8080));
    }

    #[test]
    fn test_wildcard_within_label() {
        assert!(pat("*host").matches("localhost", 80));
        assert!(!pat("*host").matches("my.host", 80));
        assert!(pat("api.*.example.com").matches("api.eu.example.com", 443));
        assert!(!pat("api.*.example.com").matches("api.example.com", 443));
    }

    #[test]
    fn test_bare_star_matches_everything() {
        assert!(pat("*").matches("any.depth.of.host", 1234));
        assert!(pat("*").matches("host", 80));
    }

    #[test]
    fn test_wildcard_with_port_rejected() {
        assert!(HostPattern::parse("*.example.com:8080").is_err());
        assert!(HostPattern::parse("http://example.com").is_err());
        assert!(HostPattern::parse("example.com/path").is_err());
        assert!(HostPattern::parse("").is_err());
    }

    #[test]
    fn test_precedence_exact_host_port_wins() {
        let patterns = vec![pat("*"), pat("host"), pat("host:8080"), pat("*ost")];
        let winner = best_match(&patterns, "host", 8080).unwrap();
        assert_eq!(winner.as_str(), "host:8080");
    }

    #[test]
    fn test_precedence_exact_host_over_wildcard() {
        let patterns = vec![pat("*ost"), pat("host"), pat("*")];
        let winner = best_match(&patterns, "host", 80).unwrap();
        assert_eq!(winner.as_str(), "host");
    }

    #[test]
    fn test_precedence_longest_literal_suffix() {
        let patterns = vec![pat("*.com"), pat("*.example.com"), pat("*")];
        let winner = best_match(&patterns, "www.example.com", 80).unwrap();
        assert_eq!(winner.as_str(), "*.example.com");
    }

    #[test]
    fn test_no_match() {
        let patterns = vec![pat("other.host")];
        assert!(best_match(&patterns, "host", 80).is_none());
    }
}
