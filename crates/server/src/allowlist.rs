//! CIDR allow-list gating the caller-facing endpoints.
//!
//! Agents register from anywhere; external callers must come from a listed
//! network. Plain addresses are treated as single-host networks.

use std::net::IpAddr;

use tracing::warn;

/// Parsed allow-list. An empty list allows nobody.
#[derive(Debug, Clone, Default)]
pub struct AllowedNets {
    nets: Vec<Net>,
}

#[derive(Debug, Clone, Copy)]
struct Net {
    addr: IpAddr,
    prefix: u8,
}

impl AllowedNets {
    /// Parse a list of IPs or CIDRs, skipping (and logging) invalid entries.
    pub fn parse(upstreams: &[String]) -> Self {
        let mut nets = Vec::with_capacity(upstreams.len());

        for entry in upstreams {
            let (addr, prefix) = match entry.split_once('/') {
                Some((addr, prefix)) => (addr, Some(prefix)),
                None => (entry.as_str(), None),
            };

            let Ok(addr) = addr.parse::<IpAddr>() else {
                warn!(entry, "skipping unparseable upstream entry");
                continue;
            };

            let max_prefix = if addr.is_ipv4() { 32 } else { 128 };
            let prefix = match prefix {
                None => max_prefix,
                Some(p) => match p.parse::<u8>() {
                    Ok(p) if p <= max_prefix => p,
                    _ => {
                        warn!(entry, "skipping upstream entry with bad prefix");
                        continue;
                    }
                },
            };

            nets.push(Net { addr, prefix });
        }

        Self { nets }
    }

    /// True when `ip` falls inside any listed network.
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(ip))
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }
}

impl std::fmt::Display for AllowedNets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.nets.is_empty() {
            return f.write_str("(none)");
        }
        for (idx, net) in self.nets.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}/{}", net.addr, net.prefix)?;
        }
        Ok(())
    }
}

impl Net {
    fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix)
                };
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix)
                };
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[&str]) -> AllowedNets {
        AllowedNets::parse(&entries.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn plain_addresses_match_exactly() {
        let allow = list(&["192.168.1.5"]);
        assert!(allow.contains("192.168.1.5".parse().unwrap()));
        assert!(!allow.contains("192.168.1.6".parse().unwrap()));
    }

    #[test]
    fn cidr_ranges_match() {
        let allow = list(&["10.0.0.0/8", "2001:db8::/32"]);
        assert!(allow.contains("10.200.3.4".parse().unwrap()));
        assert!(!allow.contains("11.0.0.1".parse().unwrap()));
        assert!(allow.contains("2001:db8::1".parse().unwrap()));
        assert!(!allow.contains("2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn zero_prefix_matches_everything_in_family() {
        let allow = list(&["0.0.0.0/0"]);
        assert!(allow.contains("203.0.113.9".parse().unwrap()));
        assert!(!allow.contains("::1".parse().unwrap()));
    }

    #[test]
    fn empty_list_allows_nobody() {
        let allow = list(&[]);
        assert!(allow.is_empty());
        assert!(!allow.contains("127.0.0.1".parse().unwrap()));
        assert_eq!(allow.to_string(), "(none)");
    }

    #[test]
    fn junk_entries_are_skipped() {
        let allow = list(&["not-an-ip", "10.0.0.0/99", "127.0.0.1"]);
        assert!(allow.contains("127.0.0.1".parse().unwrap()));
        assert_eq!(allow.to_string(), "127.0.0.1/32");
    }
}
