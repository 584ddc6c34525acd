use serde::Serialize;

/// Result of mapping a recipient address onto the tenant/domain model.
///
/// `domain` is only set when the root domain of the address is allow-listed.
/// A `None` domain is the rejection sentinel: the recipient must not produce
/// a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifiedRecipient {
    pub raw_address: String,
    pub domain: Option<String>,
    pub slug: String,
    pub username: Option<String>,
    pub is_member: bool,
}

impl ClassifiedRecipient {
    fn rejected(raw_address: &str) -> Self {
        Self {
            raw_address: raw_address.to_string(),
            domain: None,
            slug: String::new(),
            username: None,
            is_member: false,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.domain.is_some()
    }
}

/// Classify a recipient address.
///
/// Member form: `slug@user.main.tld` (any number of sub-labels).
/// Visitor form: `slug@main.tld`.
///
/// The split point is always the first `@`; anything after it, including
/// further `@` characters, belongs to the domain part.
pub fn classify(address: &str, allowed_root_domains: &[String]) -> ClassifiedRecipient {
    let lowered = address.to_lowercase();

    let Some((slug, domain_part)) = lowered.split_once('@') else {
        return ClassifiedRecipient::rejected(address);
    };

    let mut labels: Vec<&str> = domain_part.split('.').collect();
    if labels.len() < 2 {
        return ClassifiedRecipient::rejected(address);
    }

    // len >= 2 checked above
    let tld = labels.pop().unwrap_or_default();
    let main = labels.pop().unwrap_or_default();
    let root_domain = format!("{main}.{tld}");

    if !allowed_root_domains.iter().any(|d| *d == root_domain) {
        return ClassifiedRecipient::rejected(address);
    }

    if labels.is_empty() {
        ClassifiedRecipient {
            raw_address: address.to_string(),
            domain: Some(root_domain),
            slug: slug.to_string(),
            username: None,
            is_member: false,
        }
    } else {
        ClassifiedRecipient {
            raw_address: address.to_string(),
            domain: Some(root_domain),
            slug: slug.to_string(),
            username: Some(labels.join(".")),
            is_member: true,
        }
    }
}

/// Extract the domain part of an address (everything after the first `@`).
pub fn address_domain(address: &str) -> Option<&str> {
    address
        .split_once('@')
        .map(|(_, domain)| domain)
        .filter(|domain| !domain.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow(domains: &[&str]) -> Vec<String> {
        domains.iter().map(|d| d.to_string()).collect()
    }

    #[test]
    fn test_visitor_address() {
        let result = classify("alice@example.com", &allow(&["example.com"]));
        assert_eq!(result.domain.as_deref(), Some("example.com"));
        assert_eq!(result.slug, "alice");
        assert_eq!(result.username, None);
        assert!(!result.is_member);
    }

    #[test]
    fn test_member_address() {
        let result = classify("alice@bob.example.com", &allow(&["example.com"]));
        assert_eq!(result.domain.as_deref(), Some("example.com"));
        assert_eq!(result.slug, "alice");
        assert_eq!(result.username.as_deref(), Some("bob"));
        assert!(result.is_member);
    }

    #[test]
    fn test_member_with_nested_labels_keeps_order() {
        let result = classify("news@u.sub.main.tld", &allow(&["main.tld"]));
        assert_eq!(result.domain.as_deref(), Some("main.tld"));
        assert_eq!(result.username.as_deref(), Some("u.sub"));
        assert_eq!(result.slug, "news");
        assert!(result.is_member);
    }

    #[test]
    fn test_not_allow_listed() {
        let allowed = allow(&["example.com"]);
        for address in [
            "foo@notallowed.com",
            "foo@bob.notallowed.com",
            "foo@example.com.evil.org",
            "foo@a.b.c.d.net",
        ] {
            let result = classify(address, &allowed);
            assert_eq!(result.domain, None, "{address}");
            assert!(!result.is_member, "{address}");
        }
    }

    #[test]
    fn test_malformed_addresses() {
        let allowed = allow(&["example.com"]);
        for address in ["", "no-at-sign", "alice@localhost", "alice@", "@", "alice@."] {
            let result = classify(address, &allowed);
            assert_eq!(result.domain, None, "{address:?}");
            assert_eq!(result.raw_address, address);
        }
    }

    #[test]
    fn test_split_on_first_at() {
        // "b@example.com" is the domain part, its first label keeps the '@'
        let result = classify("a@b@x.example.com", &allow(&["example.com"]));
        assert_eq!(result.slug, "a");
        assert_eq!(result.domain.as_deref(), Some("example.com"));
        assert_eq!(result.username.as_deref(), Some("b@x"));
    }

    #[test]
    fn test_case_insensitive() {
        let result = classify("Alice@Bob.Example.COM", &allow(&["example.com"]));
        assert_eq!(result.slug, "alice");
        assert_eq!(result.username.as_deref(), Some("bob"));
        assert_eq!(result.raw_address, "Alice@Bob.Example.COM");
    }

    #[test]
    fn test_classify_is_idempotent() {
        let allowed = allow(&["example.com", "test.org"]);
        for address in ["x@example.com", "x@y.test.org", "x@nope.net", "garbage"] {
            assert_eq!(classify(address, &allowed), classify(address, &allowed));
        }
    }

    #[test]
    fn test_address_domain() {
        assert_eq!(address_domain("user@example.com"), Some("example.com"));
        assert_eq!(address_domain("user@"), None);
        assert_eq!(address_domain("invalid"), None);
    }
}
