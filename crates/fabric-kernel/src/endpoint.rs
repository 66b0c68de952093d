//! The declarative shape of a single subscribed endpoint.

use crate::actor::ClaimsExpr;
use crate::bus::QueueGroup;

/// Per-subscription knobs beyond the bare `(method, route)` address.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    /// Overrides the Publisher-side default ack window for callers of this
    /// endpoint, if set.
    pub ack_window_ms: Option<u64>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self { ack_window_ms: None }
    }
}

/// `(method, route, queueGroup, requiredClaimsExpr?, subscriptionOptions)`.
#[derive(Debug, Clone)]
pub struct EndpointDefinition {
    method: String,
    route: String,
    queue_group: QueueGroup,
    required_claims: Option<ClaimsExpr>,
    options: SubscriptionOptions,
}

impl EndpointDefinition {
    /// A new endpoint with the bus-distributed (`default`) queue group and
    /// no required claims.
    pub fn new(method: impl Into<String>, route: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            route: route.into(),
            queue_group: QueueGroup::Default,
            required_claims: None,
            options: SubscriptionOptions::default(),
        }
    }

    /// Deliver to every replica instead of one per queue group.
    pub fn with_all_replicas(mut self) -> Self {
        self.queue_group = QueueGroup::None;
        self
    }

    /// Gate this endpoint behind a required-claims expression.
    pub fn with_required_claims(mut self, expr: ClaimsExpr) -> Self {
        self.required_claims = Some(expr);
        self
    }

    /// Override subscription options.
    pub fn with_options(mut self, options: SubscriptionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn queue_group(&self) -> QueueGroup {
        self.queue_group
    }

    pub fn required_claims(&self) -> Option<&ClaimsExpr> {
        self.required_claims.as_ref()
    }

    pub fn options(&self) -> &SubscriptionOptions {
        &self.options
    }

    /// The shared queue-group key the bus groups replicas under:
    /// `host + method + route`.
    pub fn queue_group_key(&self, host: &str) -> String {
        format!("{host}:{}:{}", self.method, self.route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_queue_group_is_bus_distributed() {
        let ep = EndpointDefinition::new("GET", "/widgets");
        assert_eq!(ep.queue_group(), QueueGroup::Default);
    }

    #[test]
    fn with_all_replicas_switches_queue_group() {
        let ep = EndpointDefinition::new("GET", "/widgets").with_all_replicas();
        assert_eq!(ep.queue_group(), QueueGroup::None);
    }

    #[test]
    fn queue_group_key_is_stable_per_host_method_route() {
        let ep = EndpointDefinition::new("GET", "/widgets");
        assert_eq!(ep.queue_group_key("svc"), "svc:GET:/widgets");
    }

    #[test]
    fn required_claims_gate_is_attached() {
        let expr = ClaimsExpr::parse("roles.admin").unwrap();
        let ep = EndpointDefinition::new("DELETE", "/widgets/1").with_required_claims(expr);
        assert!(ep.required_claims().is_some());
    }
}
