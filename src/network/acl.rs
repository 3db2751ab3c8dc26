//! IP access control list
//!
//! Parses deny rules of the form "all", "a.b.c.d", "a.b.c.d/bits" or
//! "a.b.c.d/e.f.g.h". IPv6 rules match a single exact address.

use std::net::{IpAddr, Ipv4Addr};

/// An address + mask pair. IPv4 values are in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessRule {
    /// Matches every address.
    All,
    V4 { ip: u32, mask: u32 },
    V6Exact(std::net::Ipv6Addr),
}

impl AccessRule {
    pub fn matches(&self, addr: IpAddr) -> bool {
        match (self, addr) {
            (AccessRule::All, _) => true,
            (AccessRule::V4 { ip, mask }, IpAddr::V4(v4)) => {
                (u32::from(v4) & mask) == (ip & mask)
            }
            (AccessRule::V6Exact(rule), IpAddr::V6(v6)) => *rule == v6,
            _ => false,
        }
    }
}

/// Parse one rule. Returns `None` on invalid input.
pub fn parse_rule(s: &str) -> Option<AccessRule> {
    let s = s.trim();
    if s == "all" {
        return Some(AccessRule::All);
    }

    if let Some((addr_part, mask_part)) = s.split_once('/') {
        let ip = u32::from(addr_part.parse::<Ipv4Addr>().ok()?);
        if mask_part.contains('.') {
            let mask = u32::from(mask_part.parse::<Ipv4Addr>().ok()?);
            return Some(AccessRule::V4 { ip, mask });
        }
        let bits: u32 = mask_part.parse().ok()?;
        if bits > 32 {
            return None;
        }
        return Some(AccessRule::V4 {
            ip,
            mask: prefix_to_mask(bits),
        });
    }

    match s.parse::<IpAddr>().ok()? {
        IpAddr::V4(v4) => Some(AccessRule::V4 {
            ip: u32::from(v4),
            mask: u32::MAX,
        }),
        IpAddr::V6(v6) => Some(AccessRule::V6Exact(v6)),
    }
}

fn prefix_to_mask(bits: u32) -> u32 {
    if bits == 0 {
        0
    } else {
        u32::MAX << (32 - bits)
    }
}

/// Ordered deny list consulted before a connection is admitted.
#[derive(Debug, Clone, Default)]
pub struct AccessList {
    deny: Vec<AccessRule>,
}

impl AccessList {
    /// Builds the list, naming the first rule that fails to parse.
    pub fn from_rules<S: AsRef<str>>(rules: &[S]) -> anyhow::Result<Self> {
        let mut deny = Vec::with_capacity(rules.len());
        for rule in rules {
            let rule = rule.as_ref();
            let parsed = parse_rule(rule)
                .ok_or_else(|| anyhow::anyhow!("invalid deny rule: {:?}", rule))?;
            deny.push(parsed);
        }
        Ok(Self { deny })
    }

    pub fn is_denied(&self, addr: IpAddr) -> bool {
        self.deny.iter().any(|rule| rule.matches(addr))
    }

    pub fn is_empty(&self) -> bool {
        self.deny.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn all_matches_everything() {
        let rule = parse_rule("all").unwrap();
        assert!(rule.matches(v4(1, 2, 3, 4)));
        assert!(rule.matches("::1".parse().unwrap()));
    }

    #[test]
    fn exact_host() {
        let rule = parse_rule("192.168.1.1").unwrap();
        assert!(rule.matches(v4(192, 168, 1, 1)));
        assert!(!rule.matches(v4(192, 168, 1, 2)));
    }

    #[test]
    fn cidr_prefix() {
        let rule = parse_rule("192.168.1.0/24").unwrap();
        assert!(rule.matches(v4(192, 168, 1, 42)));
        assert!(!rule.matches(v4(192, 168, 2, 42)));
    }

    #[test]
    fn dotted_mask() {
        let rule = parse_rule("10.0.0.0/255.0.0.0").unwrap();
        assert!(rule.matches(v4(10, 99, 1, 2)));
        assert!(!rule.matches(v4(11, 0, 0, 0)));
    }

    #[test]
    fn ipv6_exact_only() {
        let rule = parse_rule("::1").unwrap();
        assert!(rule.matches("::1".parse().unwrap()));
        assert!(!rule.matches("::2".parse().unwrap()));
        assert!(!rule.matches(v4(127, 0, 0, 1)));
    }

    #[test]
    fn invalid_inputs() {
        assert!(parse_rule("").is_none());
        assert!(parse_rule("999.0.0.1").is_none());
        assert!(parse_rule("1.2.3.4/33").is_none());
        assert!(parse_rule("not-an-ip").is_none());
    }

    #[test]
    fn access_list_reports_bad_rule() {
        let err = AccessList::from_rules(&["10.0.0.0/8", "bogus"]).unwrap_err();
        assert!(err.to_string().contains("bogus"));

        let list = AccessList::from_rules(&["10.0.0.0/8"]).unwrap();
        assert!(list.is_denied(v4(10, 1, 1, 1)));
        assert!(!list.is_denied(v4(127, 0, 0, 1)));
    }
}
