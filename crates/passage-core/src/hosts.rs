//! Static hostname overrides.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::contract::HostMapper;

/// `/etc/hosts`-style hostname-to-IP map, consulted before the resolver.
#[derive(Debug, Clone, Default)]
pub struct StaticHosts {
    entries: HashMap<String, IpAddr>,
}

impl StaticHosts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host: impl Into<String>, ip: IpAddr) {
        self.entries.insert(host.into().to_ascii_lowercase(), ip);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl HostMapper for StaticHosts {
    fn lookup(&self, host: &str) -> Option<IpAddr> {
        self.entries.get(&host.to_ascii_lowercase()).copied()
    }
}

impl<S: Into<String>> FromIterator<(S, IpAddr)> for StaticHosts {
    fn from_iter<I: IntoIterator<Item = (S, IpAddr)>>(iter: I) -> Self {
        let mut hosts = Self::new();
        for (h, ip) in iter {
            hosts.insert(h, ip);
        }
        hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let hosts: StaticHosts =
            [("Printer.Local", "192.168.1.9".parse::<IpAddr>().unwrap())]
                .into_iter()
                .collect();
        assert_eq!(
            hosts.lookup("printer.local"),
            Some("192.168.1.9".parse().unwrap())
        );
        assert_eq!(hosts.lookup("other.local"), None);
    }
}
