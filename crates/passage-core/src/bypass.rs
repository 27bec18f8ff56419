//! Destination allow/deny matching.
//!
//! A bypass holds host patterns: exact hosts, `.suffix` / `*.suffix`
//! wildcards, and IP literals. In blacklist mode (the default) a match
//! refuses the destination; in whitelist mode everything *except*
//! matches is refused.

use std::collections::HashSet;
use std::net::IpAddr;

use crate::addr::{Address, Host};
use crate::contract::Bypass;

/// Pattern-set bypass over destination hosts.
#[derive(Debug, Clone)]
pub struct HostBypass {
    exact: HashSet<String>,
    suffixes: HashSet<String>,
    ips: HashSet<IpAddr>,
    whitelist: bool,
}

impl HostBypass {
    /// Build from patterns. `*.example.com` and `.example.com` both match
    /// the domain and every subdomain.
    pub fn new<I, S>(patterns: I, whitelist: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut exact = HashSet::new();
        let mut suffixes = HashSet::new();
        let mut ips = HashSet::new();
        for p in patterns {
            let p = p.as_ref().trim().to_ascii_lowercase();
            if p.is_empty() {
                continue;
            }
            if let Ok(ip) = p.parse::<IpAddr>() {
                ips.insert(ip);
            } else if let Some(s) = p.strip_prefix("*.") {
                suffixes.insert(s.to_string());
                exact.insert(s.to_string());
            } else if let Some(s) = p.strip_prefix('.') {
                suffixes.insert(s.to_string());
                exact.insert(s.to_string());
            } else {
                exact.insert(p);
            }
        }
        Self {
            exact,
            suffixes,
            ips,
            whitelist,
        }
    }

    fn matches(&self, addr: &Address) -> bool {
        match &addr.host {
            Host::Ip(ip) => self.ips.contains(ip),
            Host::Domain(d) => {
                let d = d.to_ascii_lowercase();
                if self.exact.contains(&d) {
                    return true;
                }
                // strip labels left-to-right looking for a suffix entry
                let mut rest = d.as_str();
                while let Some(dot) = rest.find('.') {
                    rest = &rest[dot + 1..];
                    if self.suffixes.contains(rest) {
                        return true;
                    }
                }
                false
            }
        }
    }
}

impl Bypass for HostBypass {
    fn contains(&self, addr: &Address) -> bool {
        if self.whitelist {
            !self.matches(addr)
        } else {
            self.matches(addr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn exact_host_match() {
        let b = HostBypass::new(["blocked.example.com"], false);
        assert!(b.contains(&addr("blocked.example.com:80")));
        assert!(!b.contains(&addr("example.com:80")));
    }

    #[test]
    fn wildcard_matches_domain_and_subdomains() {
        let b = HostBypass::new(["*.example.com"], false);
        assert!(b.contains(&addr("example.com:443")));
        assert!(b.contains(&addr("deep.sub.example.com:443")));
        assert!(!b.contains(&addr("notexample.com:443")));
    }

    #[test]
    fn ip_literal_match() {
        let b = HostBypass::new(["10.0.0.1"], false);
        assert!(b.contains(&addr("10.0.0.1:22")));
        assert!(!b.contains(&addr("10.0.0.2:22")));
    }

    #[test]
    fn whitelist_inverts() {
        let b = HostBypass::new(["allowed.example.com"], true);
        assert!(!b.contains(&addr("allowed.example.com:80")));
        assert!(b.contains(&addr("other.example.com:80")));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let b = HostBypass::new(["Blocked.Example.COM"], false);
        assert!(b.contains(&addr("blocked.example.com:80")));
    }
}
