use std::net::IpAddr;

use ipnet::IpNet;
use thiserror::Error;
use tracing::warn;

/// A CIDR entry that could not be parsed. Recoverable: the offending rule is
/// rejected and reported, the rest of the rule set stays usable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("malformed CIDR rule '{rule}': {reason}")]
pub struct MalformedCidr {
    pub rule: String,
    pub reason: String,
}

/// One entry of a no-proxy list. Each variant matches an `(address, port)`
/// target; a match means "connect directly, do not use the proxy."
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoProxyRule {
    /// `*` matches every target.
    Wildcard,
    /// Matches the domain itself and any subdomain on a dot boundary.
    Domain(String),
    /// Exact string match on the address; a rule without a port matches any
    /// port.
    Address { address: String, port: Option<u16> },
    /// Matches addresses inside the network, by mask comparison.
    CidrBlock(IpNet),
}

impl NoProxyRule {
    /// Parses a single no-proxy entry. Entries containing `/` are CIDR
    /// blocks and may fail; every other shape has a fallback reading.
    pub fn parse(entry: &str) -> Result<NoProxyRule, MalformedCidr> {
        let entry = entry.trim();
        if entry == "*" {
            return Ok(NoProxyRule::Wildcard);
        }
        if entry.contains('/') {
            let net = entry.parse::<IpNet>().map_err(|err| MalformedCidr {
                rule: entry.to_string(),
                reason: err.to_string(),
            })?;
            return Ok(NoProxyRule::CidrBlock(net));
        }
        if entry.parse::<IpAddr>().is_ok() {
            return Ok(NoProxyRule::Address {
                address: entry.to_ascii_lowercase(),
                port: None,
            });
        }
        if let Some((host, port)) = entry.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                return Ok(NoProxyRule::Address {
                    address: host.to_ascii_lowercase(),
                    port: Some(port),
                });
            }
        }
        // Leading dots are a common way of writing domain suffixes; the
        // dot-boundary match below already implies them.
        Ok(NoProxyRule::Domain(
            entry.trim_start_matches('.').to_ascii_lowercase(),
        ))
    }

    pub fn matches(&self, address: &str, port: u16) -> bool {
        let address = address.to_ascii_lowercase();
        match self {
            NoProxyRule::Wildcard => true,
            NoProxyRule::Domain(domain) => {
                address == *domain || address.ends_with(&format!(".{domain}"))
            }
            NoProxyRule::Address {
                address: rule_address,
                port: rule_port,
            } => address == *rule_address && rule_port.map(|p| p == port).unwrap_or(true),
            NoProxyRule::CidrBlock(net) => match address.parse::<IpAddr>() {
                Ok(ip) => net.contains(&ip),
                Err(_) => false,
            },
        }
    }
}

/// An ordered no-proxy rule set. The first matching rule wins; no match
/// means the proxy should be used.
#[derive(Debug, Clone, Default)]
pub struct NoProxyRules {
    rules: Vec<NoProxyRule>,
}

impl NoProxyRules {
    pub fn new(rules: Vec<NoProxyRule>) -> Self {
        Self { rules }
    }

    /// Parses a comma-separated no-proxy list. Malformed CIDR entries are
    /// returned alongside the usable rules.
    pub fn parse_list(list: &str) -> (NoProxyRules, Vec<MalformedCidr>) {
        let mut rules = Vec::new();
        let mut errors = Vec::new();
        for entry in list.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match NoProxyRule::parse(entry) {
                Ok(rule) => rules.push(rule),
                Err(error) => {
                    warn!(rule = %error.rule, reason = %error.reason, "ignoring malformed no-proxy rule");
                    errors.push(error);
                }
            }
        }
        (NoProxyRules { rules }, errors)
    }

    /// True when the target should bypass the proxy.
    pub fn bypass_proxy(&self, address: &str, port: u16) -> bool {
        self.rules.iter().any(|rule| rule.matches(address, port))
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }
}
