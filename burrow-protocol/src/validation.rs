//! Input validation for names crossing the trust boundary

/// Check one DNS label as used for tunnel subdomains: 1-63 chars, lowercase
/// alphanumeric and hyphens, no leading or trailing hyphen.
pub fn is_valid_subdomain(label: &str) -> bool {
    if label.is_empty() || label.len() > 63 {
        return false;
    }
    if label.starts_with('-') || label.ends_with('-') {
        return false;
    }
    label
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Check a full hostname: dot-separated valid labels, max 253 chars.
pub fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(is_valid_subdomain)
}

/// Match a subdomain against one permission pattern.
///
/// `"*"` permits any syntactically valid subdomain; a trailing `*` permits
/// any subdomain with that literal prefix; anything else must match exactly.
pub fn subdomain_matches(pattern: &str, label: &str) -> bool {
    if !is_valid_subdomain(label) {
        return false;
    }
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return label.starts_with(prefix);
    }
    pattern == label
}

/// True when any of the patterns permits the subdomain.
pub fn subdomain_permitted(patterns: &[String], label: &str) -> bool {
    patterns.iter().any(|p| subdomain_matches(p, label))
}

/// Normalize an HTTP `Host` value for routing: strip the port, lowercase.
pub fn normalize_host(host: &str) -> String {
    let stripped = if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6 literal, possibly with a port after the bracket.
        rest.split(']').next().unwrap_or(rest)
    } else {
        host.rsplit_once(':').map_or(host, |(h, _)| h)
    };
    stripped.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subdomain_syntax() {
        assert!(is_valid_subdomain("myapp"));
        assert!(is_valid_subdomain("my-app-2"));
        assert!(!is_valid_subdomain(""));
        assert!(!is_valid_subdomain("-lead"));
        assert!(!is_valid_subdomain("trail-"));
        assert!(!is_valid_subdomain("UpperCase"));
        assert!(!is_valid_subdomain("dots.inside"));
        assert!(!is_valid_subdomain(&"x".repeat(64)));
    }

    #[test]
    fn test_wildcard_matching() {
        assert!(subdomain_matches("*", "anything"));
        assert!(subdomain_matches("user-*", "user-dev"));
        assert!(subdomain_matches("user-*", "user-"));
        assert!(!subdomain_matches("user-*", "other"));
        assert!(subdomain_matches("exact", "exact"));
        assert!(!subdomain_matches("exact", "exact2"));
        // Invalid labels never match, even against "*".
        assert!(!subdomain_matches("*", "Not.Valid"));
    }

    #[test]
    fn test_permitted_list() {
        let patterns = vec!["myapp".to_string(), "stage-*".to_string()];
        assert!(subdomain_permitted(&patterns, "myapp"));
        assert!(subdomain_permitted(&patterns, "stage-7"));
        assert!(!subdomain_permitted(&patterns, "prod"));
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("MyApp.Example.Test:8443"), "myapp.example.test");
        assert_eq!(normalize_host("plain.example.test"), "plain.example.test");
        assert_eq!(normalize_host("[::1]:8080"), "::1");
    }

    #[test]
    fn test_hostname() {
        assert!(is_valid_hostname("myapp.example.test"));
        assert!(!is_valid_hostname("bad..dots"));
        assert!(!is_valid_hostname(""));
    }
}
