/// Routing decision for a single inbound query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Forward to the configured upstream nameservers.
    Passthrough,
    /// Resolve through the ephemeral-worker indirection layer.
    Proxied,
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Passthrough => write!(f, "passthrough"),
            Route::Proxied => write!(f, "proxied"),
        }
    }
}

/// Suffix set of domains that resolve through the proxy layer.
///
/// Entries are normalised once at construction; matching during query
/// handling is read-only and allocation-free.
#[derive(Debug, Clone, Default)]
pub struct ProxyDomainSet {
    suffixes: Vec<String>,
}

impl ProxyDomainSet {
    pub fn new(entries: impl IntoIterator<Item = String>) -> Self {
        let suffixes = entries
            .into_iter()
            .map(|entry| normalise_name(&entry))
            .filter(|entry| !entry.is_empty())
            .collect();
        Self { suffixes }
    }

    pub fn is_empty(&self) -> bool {
        self.suffixes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.suffixes.len()
    }

    fn matches(&self, normalised: &str) -> bool {
        self.suffixes.iter().any(|suffix| {
            normalised == suffix
                || (normalised.len() > suffix.len()
                    && normalised.ends_with(suffix)
                    && normalised.as_bytes()[normalised.len() - suffix.len() - 1] == b'.')
        })
    }
}

/// Strip the trailing dot of a wire-form name and lower-case it.
pub fn normalise_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Decide whether a query is proxied or forwarded upstream.
///
/// Membership is suffix-based: a name matches when it equals a configured
/// suffix or ends with `.<suffix>`. An empty set routes everything upstream.
pub fn classify(name: &str, domains: &ProxyDomainSet) -> Route {
    if domains.is_empty() {
        return Route::Passthrough;
    }
    if domains.matches(&normalise_name(name)) {
        Route::Proxied
    } else {
        Route::Passthrough
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(entries: &[&str]) -> ProxyDomainSet {
        ProxyDomainSet::new(entries.iter().map(|s| s.to_string()))
    }

    #[test]
    fn empty_set_routes_everything_upstream() {
        let empty = ProxyDomainSet::default();
        assert_eq!(classify("news.blocked.org", &empty), Route::Passthrough);
        assert_eq!(classify("example.com.", &empty), Route::Passthrough);
    }

    #[test]
    fn exact_suffix_match_is_proxied() {
        let domains = set(&["blocked.org"]);
        assert_eq!(classify("blocked.org", &domains), Route::Proxied);
        assert_eq!(classify("blocked.org.", &domains), Route::Proxied);
    }

    #[test]
    fn subdomain_of_suffix_is_proxied() {
        let domains = set(&["blocked.org"]);
        assert_eq!(classify("news.blocked.org", &domains), Route::Proxied);
        assert_eq!(classify("a.b.news.blocked.org.", &domains), Route::Proxied);
    }

    #[test]
    fn partial_label_overlap_is_not_a_match() {
        let domains = set(&["blocked.org"]);
        assert_eq!(classify("notblocked.org", &domains), Route::Passthrough);
        assert_eq!(classify("blocked.org.evil.com", &domains), Route::Passthrough);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let domains = set(&["Blocked.ORG"]);
        assert_eq!(classify("NEWS.blocked.org", &domains), Route::Proxied);
    }

    #[test]
    fn configured_entries_are_normalised() {
        let domains = set(&["  blocked.org.  ", ""]);
        assert_eq!(domains.len(), 1);
        assert_eq!(classify("blocked.org", &domains), Route::Proxied);
    }

    #[test]
    fn unrelated_domain_passes_through() {
        let domains = set(&["blocked.org", "censored.example"]);
        assert_eq!(classify("rust-lang.org", &domains), Route::Passthrough);
        assert_eq!(classify("sub.censored.example", &domains), Route::Proxied);
    }
}
