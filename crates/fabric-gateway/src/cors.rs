//! CORS decision logic for the HTTP ingress.
//!
//! A thin wrapper rather than `tower_http::cors::CorsLayer` directly: the
//! ingress needs a disallowed origin to produce `403` (tower-http's default
//! is to silently omit the allow-origin header and let the browser enforce
//! same-origin), and an absent `Origin` header to pass through untouched.

use std::collections::HashSet;

/// The parsed `AllowedOrigins` ingress config key.
#[derive(Debug, Clone)]
pub enum AllowedOrigins {
    Any,
    List(HashSet<String>),
}

impl AllowedOrigins {
    pub fn parse(csv: &str) -> Self {
        let entries: Vec<&str> = csv.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
        if entries.iter().any(|&e| e == "*") {
            AllowedOrigins::Any
        } else {
            AllowedOrigins::List(entries.into_iter().map(str::to_string).collect())
        }
    }

    pub fn allows(&self, origin: &str) -> bool {
        match self {
            AllowedOrigins::Any => true,
            AllowedOrigins::List(set) => set.contains(origin),
        }
    }
}

/// The outcome of evaluating a request's CORS posture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsDecision {
    /// No `Origin` header: not a cross-origin request, pass through.
    NotCors,
    /// `Origin` present but not in `AllowedOrigins`: reject with `403`.
    Disallowed,
    /// `OPTIONS` preflight from an allowed origin: `204` with the origin
    /// echoed back, handler never invoked.
    Preflight { echo_origin: String },
    /// Simple request from an allowed origin: proceed, then echo the origin
    /// on the response.
    Allowed { echo_origin: String },
}

/// Evaluate CORS for one request. `method` is the HTTP method as an
/// uppercase string (`"OPTIONS"`, `"GET"`, ...).
pub fn evaluate(method: &str, origin: Option<&str>, allowed: &AllowedOrigins) -> CorsDecision {
    let Some(origin) = origin else {
        return CorsDecision::NotCors;
    };
    if !allowed.allows(origin) {
        return CorsDecision::Disallowed;
    }
    if method.eq_ignore_ascii_case("OPTIONS") {
        CorsDecision::Preflight { echo_origin: origin.to_string() }
    } else {
        CorsDecision::Allowed { echo_origin: origin.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_origin_passes_through() {
        let allowed = AllowedOrigins::parse("allowed.origin");
        assert_eq!(evaluate("GET", None, &allowed), CorsDecision::NotCors);
    }

    #[test]
    fn allowed_simple_request_echoes_origin() {
        let allowed = AllowedOrigins::parse("allowed.origin");
        assert_eq!(
            evaluate("GET", Some("allowed.origin"), &allowed),
            CorsDecision::Allowed { echo_origin: "allowed.origin".into() }
        );
    }

    #[test]
    fn preflight_from_allowed_origin_is_204() {
        let allowed = AllowedOrigins::parse("allowed.origin");
        assert_eq!(
            evaluate("OPTIONS", Some("allowed.origin"), &allowed),
            CorsDecision::Preflight { echo_origin: "allowed.origin".into() }
        );
    }

    #[test]
    fn disallowed_origin_is_rejected() {
        let allowed = AllowedOrigins::parse("allowed.origin");
        assert_eq!(evaluate("GET", Some("evil.example"), &allowed), CorsDecision::Disallowed);
    }

    #[test]
    fn star_allows_any_origin() {
        let allowed = AllowedOrigins::parse("*");
        assert_eq!(
            evaluate("GET", Some("anything.example"), &allowed),
            CorsDecision::Allowed { echo_origin: "anything.example".into() }
        );
    }
}
