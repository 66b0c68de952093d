//! `PortMappings` parsing and the `resolveInternalURL` routing algorithm.
//!
//! A mapping rule reads `ext:req->served`, where `ext` and `req` are either
//! an exact port number or `*`, and `served` is either an exact port number
//! or `*` meaning "keep the requested port". Given an external port and a
//! request path of the form `host[:port]/route`, [`PortMappings::resolve`]
//! picks the most specific matching rule — exactness on `ext` outranks
//! exactness on `req` — breaking ties by declaration order.

use fabric_kernel::subject::{split_host_from_path, SubjectError};
use thiserror::Error;

/// Business endpoints default to this internal port when a request path
/// does not name one explicitly (see the fabric's port convention).
pub const DEFAULT_INTERNAL_PORT: u16 = 443;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PortMappingError {
    #[error("malformed port mapping rule: {0}")]
    MalformedRule(String),
    #[error("malformed request path: {0}")]
    MalformedPath(#[from] SubjectError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortMatch {
    Exact(u16),
    Any,
}

impl PortMatch {
    fn parse(token: &str) -> Result<Self, PortMappingError> {
        let token = token.trim();
        if token == "*" {
            Ok(PortMatch::Any)
        } else {
            token
                .parse::<u16>()
                .map(PortMatch::Exact)
                .map_err(|_| PortMappingError::MalformedRule(token.to_string()))
        }
    }

    fn matches(&self, port: u16) -> bool {
        matches!(self, PortMatch::Any) || *self == PortMatch::Exact(port)
    }

    /// `1` for an exact match, `0` for a wildcard — used to rank rules.
    fn specificity(&self) -> u8 {
        match self {
            PortMatch::Exact(_) => 1,
            PortMatch::Any => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServedPort {
    Exact(u16),
    Keep,
}

impl ServedPort {
    fn parse(token: &str) -> Result<Self, PortMappingError> {
        let token = token.trim();
        if token == "*" {
            Ok(ServedPort::Keep)
        } else {
            token
                .parse::<u16>()
                .map(ServedPort::Exact)
                .map_err(|_| PortMappingError::MalformedRule(token.to_string()))
        }
    }
}

#[derive(Debug, Clone)]
struct PortRule {
    external: PortMatch,
    requested: PortMatch,
    served: ServedPort,
}

/// The parsed `PortMappings` ingress config key: an ordered list of rules.
#[derive(Debug, Clone)]
pub struct PortMappings {
    rules: Vec<PortRule>,
}

impl Default for PortMappings {
    fn default() -> Self {
        // `8080:*->*, 443:*->443, 80:*->443`
        Self::parse("8080:*->*, 443:*->443, 80:*->443").expect("default port mappings are well-formed")
    }
}

impl PortMappings {
    /// Parse a comma-separated `ext:req->served` rule list.
    pub fn parse(spec: &str) -> Result<Self, PortMappingError> {
        let mut rules = Vec::new();
        for entry in spec.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (ports, served) = entry
                .split_once("->")
                .ok_or_else(|| PortMappingError::MalformedRule(entry.to_string()))?;
            let (external, requested) = ports
                .split_once(':')
                .ok_or_else(|| PortMappingError::MalformedRule(entry.to_string()))?;
            rules.push(PortRule {
                external: PortMatch::parse(external)?,
                requested: PortMatch::parse(requested)?,
                served: ServedPort::parse(served)?,
            });
        }
        Ok(Self { rules })
    }

    /// Resolve the served internal port for a request landing on
    /// `external_port` and addressing `requested_port`. Ties between rules
    /// of equal specificity are broken by declaration order (first wins).
    /// Returns `None` when no rule matches — the caller returns `404`.
    pub fn resolve(&self, external_port: u16, requested_port: u16) -> Option<u16> {
        let mut best: Option<(u8, &PortRule)> = None;
        for rule in &self.rules {
            if !rule.external.matches(external_port) || !rule.requested.matches(requested_port) {
                continue;
            }
            let score = rule.external.specificity() * 2 + rule.requested.specificity();
            if best.map(|(best_score, _)| score > best_score).unwrap_or(true) {
                best = Some((score, rule));
            }
        }
        best.map(|(_, rule)| match rule.served {
            ServedPort::Exact(port) => port,
            ServedPort::Keep => requested_port,
        })
    }
}

/// The outcome of resolving an external request path to an internal one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalRoute {
    pub host: String,
    pub port: u16,
    pub route: String,
}

/// `resolveInternalURL(externalURL, portMappings)`: split `path` into
/// `host[:port]/route`, default the requested port to
/// [`DEFAULT_INTERNAL_PORT`], then resolve the served port via `mappings`.
/// `None` means the request is unmapped and must be rejected with `404`.
pub fn resolve_internal_url(
    external_port: u16,
    path: &str,
    mappings: &PortMappings,
) -> Result<Option<InternalRoute>, PortMappingError> {
    let (host, requested_port, route) = split_host_from_path(path)?;
    let requested_port = requested_port.unwrap_or(DEFAULT_INTERNAL_PORT);
    Ok(mappings
        .resolve(external_port, requested_port)
        .map(|port| InternalRoute { host, port, route }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mappings_parse() {
        let mappings = PortMappings::default();
        assert_eq!(mappings.resolve(8080, 9000), Some(9000));
        assert_eq!(mappings.resolve(443, 9000), Some(443));
    }

    #[test]
    fn most_specific_exact_wins_over_wildcard() {
        let mappings = PortMappings::parse("4040:*->*, 40443:*->443").unwrap();
        // GET http://localhost:4040/svc:555/x -> routed to svc:555/x
        let route = resolve_internal_url(4040, "/svc:555/x", &mappings).unwrap().unwrap();
        assert_eq!(route, InternalRoute { host: "svc".into(), port: 555, route: "/x".into() });
    }

    #[test]
    fn unmapped_external_request_port_combination_is_404() {
        let mappings = PortMappings::parse("4040:*->*, 40443:*->443").unwrap();
        // GET http://localhost:40443/svc:555/x -> 404 (40443 only maps requested==443)
        assert!(resolve_internal_url(40443, "/svc:555/x", &mappings).unwrap().is_none());
    }

    #[test]
    fn default_requested_port_is_the_business_endpoint_default() {
        let mappings = PortMappings::parse("4040:*->*, 40443:*->443").unwrap();
        // GET http://localhost:40443/svc/x -> routed to svc:443/x
        let route = resolve_internal_url(40443, "/svc/x", &mappings).unwrap().unwrap();
        assert_eq!(route, InternalRoute { host: "svc".into(), port: 443, route: "/x".into() });
    }

    #[test]
    fn ties_are_broken_by_declaration_order() {
        let mappings = PortMappings::parse("4040:*->100, 4040:*->200").unwrap();
        assert_eq!(mappings.resolve(4040, 1), Some(100));
    }

    #[test]
    fn no_matching_rule_resolves_to_none() {
        let mappings = PortMappings::parse("4040:*->*").unwrap();
        assert_eq!(mappings.resolve(9999, 1), None);
    }
}
