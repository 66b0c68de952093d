//! The per-hop request/response metadata frame.
//!
//! A [`Frame`] is a case-insensitive multimap of string to list-of-string,
//! carried alongside every bus message. All reserved keys share
//! [`INTERNAL_HEADER_PREFIX`] so an ingress can strip them from (and never
//! accept them from) untrusted external callers in one pass.

use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Prefix shared by every fabric-reserved header. Never forwarded from an
/// external client; always stripped from both the inbound request and the
/// outbound response at the HTTP ingress.
pub const INTERNAL_HEADER_PREFIX: &str = "x-fabric-";

const HDR_MESSAGE_ID: &str = "x-fabric-id";
const HDR_FROM_HOST: &str = "x-fabric-from-host";
const HDR_FROM_ID: &str = "x-fabric-from-id";
const HDR_FROM_VERSION: &str = "x-fabric-from-version";
const HDR_CALL_DEPTH: &str = "x-fabric-call-depth";
const HDR_TIME_BUDGET_MS: &str = "x-fabric-time-budget-ms";
const HDR_OP_CODE: &str = "x-fabric-op-code";
const HDR_TRACE_PARENT: &str = "x-fabric-trace-parent";
const HDR_TRACE_STATE: &str = "x-fabric-trace-state";
const HDR_ACTOR: &str = "x-fabric-actor";
const HDR_LOCALITY: &str = "x-fabric-locality";
const HDR_X_FORWARDED_HOST: &str = "x-forwarded-host";
const HDR_X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";
const HDR_X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const HDR_X_FORWARDED_FOR: &str = "x-forwarded-for";
const HDR_X_FORWARDED_PATH: &str = "x-forwarded-path";

/// Default cap on [`Frame::call_depth`]; exceeding it is a fatal, local
/// failure for the call that would have produced it.
pub const DEFAULT_MAX_CALL_DEPTH: u32 = 64;

/// A request's operation code, carried in the `op-code` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// An unprocessed request, en route to a handler.
    Req,
    /// A zero-body control frame confirming a subscriber accepted the request.
    Ack,
    /// A terminal error frame.
    Err,
    /// A successful (or partial, for a multicast stream) response frame.
    Res,
}

impl OpCode {
    /// Parse from the wire string used in the `op-code` header.
    pub fn from_str_ci(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "req" => Some(OpCode::Req),
            "ack" => Some(OpCode::Ack),
            "err" => Some(OpCode::Err),
            "res" => Some(OpCode::Res),
            _ => None,
        }
    }

    /// The wire string for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpCode::Req => "req",
            OpCode::Ack => "ack",
            OpCode::Err => "err",
            OpCode::Res => "res",
        }
    }
}

/// Errors raised while constructing or advancing a [`Frame`].
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FrameError {
    /// `call-depth` would exceed the configured cap.
    #[error("call depth {0} exceeds the maximum of {1}")]
    CallDepthExceeded(u32, u32),
    /// A header expected to hold an integer did not parse as one.
    #[error("header '{0}' has a non-integer value: '{1}'")]
    InvalidInteger(String, String),
    /// The `actor` header held a value that is not a JSON object.
    #[error("actor header did not contain a JSON object")]
    InvalidActor,
}

/// Case-insensitive multimap of reserved and user headers attached to every
/// fabric request and response.
///
/// Header names are normalized to lowercase on insertion; lookups are
/// case-insensitive by construction of the caller passing a lowercase key,
/// or by calling [`Frame::get`] which lowercases the key itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    headers: HashMap<String, Vec<String>>,
}

impl Frame {
    /// An empty frame with no headers set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the root frame for a causal chain: a fresh message id, call
    /// depth zero, and the given initial time budget.
    pub fn root(message_id: impl Into<String>, time_budget_ms: i64) -> Self {
        let mut f = Self::new();
        f.set(HDR_MESSAGE_ID, message_id.into());
        f.set_call_depth(0);
        f.set_time_budget_ms(time_budget_ms);
        f.set(HDR_OP_CODE, OpCode::Req.as_str().to_string());
        f
    }

    // ── Raw multimap access ──────────────────────────────────────────────

    /// All values for `key`, or `None` if absent. Lookup is case-insensitive.
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.headers.get(&key.to_ascii_lowercase()).map(|v| v.as_slice())
    }

    /// The first value for `key`, or `None` if absent.
    pub fn get_one(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.first()).map(String::as_str)
    }

    /// Replace all values for `key` with a single value.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.headers.insert(key.to_ascii_lowercase(), vec![value.into()]);
    }

    /// Append a value to `key`, preserving any existing values.
    pub fn add(&mut self, key: &str, value: impl Into<String>) {
        self.headers
            .entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// Remove all values for `key`.
    pub fn del(&mut self, key: &str) {
        self.headers.remove(&key.to_ascii_lowercase());
    }

    /// Whether `key` is present with at least one value.
    pub fn has(&self, key: &str) -> bool {
        self.headers.contains_key(&key.to_ascii_lowercase())
    }

    /// Iterate all header name/values pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Remove every header whose name starts with [`INTERNAL_HEADER_PREFIX`]
    /// (case-insensitively; names are already lowercased on insertion).
    ///
    /// Used by the ingress to sanitize both inbound requests (never trust a
    /// client-supplied reserved header) and outbound responses (never leak
    /// one back out).
    pub fn strip_reserved(&mut self) {
        self.headers
            .retain(|k, _| !k.starts_with(INTERNAL_HEADER_PREFIX));
    }

    // ── Typed accessors for reserved fields ──────────────────────────────

    /// The message id: unique per hop, used as the bus reply-to inbox.
    pub fn message_id(&self) -> Option<&str> {
        self.get_one(HDR_MESSAGE_ID)
    }

    /// Set the message id.
    pub fn set_message_id(&mut self, id: impl Into<String>) {
        self.set(HDR_MESSAGE_ID, id);
    }

    /// The originating host name.
    pub fn from_host(&self) -> Option<&str> {
        self.get_one(HDR_FROM_HOST)
    }

    /// Set the originating host name.
    pub fn set_from_host(&mut self, host: impl Into<String>) {
        self.set(HDR_FROM_HOST, host);
    }

    /// The originating replica id.
    pub fn from_id(&self) -> Option<&str> {
        self.get_one(HDR_FROM_ID)
    }

    /// Set the originating replica id.
    pub fn set_from_id(&mut self, id: impl Into<String>) {
        self.set(HDR_FROM_ID, id);
    }

    /// The originating service version.
    pub fn from_version(&self) -> Option<&str> {
        self.get_one(HDR_FROM_VERSION)
    }

    /// Set the originating service version.
    pub fn set_from_version(&mut self, version: impl Into<String>) {
        self.set(HDR_FROM_VERSION, version);
    }

    /// The current call depth (hop count along this causal chain).
    pub fn call_depth(&self) -> u32 {
        self.get_one(HDR_CALL_DEPTH)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Set the call depth directly (used when constructing a root frame).
    pub fn set_call_depth(&mut self, depth: u32) {
        self.set(HDR_CALL_DEPTH, depth.to_string());
    }

    /// Increment call depth for a child hop, rejecting the call locally if
    /// the result would exceed `max_depth`.
    pub fn increment_call_depth(&mut self, max_depth: u32) -> Result<(), FrameError> {
        let next = self.call_depth() + 1;
        if next > max_depth {
            return Err(FrameError::CallDepthExceeded(next, max_depth));
        }
        self.set_call_depth(next);
        Ok(())
    }

    /// The remaining time budget in milliseconds.
    pub fn time_budget_ms(&self) -> i64 {
        self.get_one(HDR_TIME_BUDGET_MS)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Set the time budget directly.
    pub fn set_time_budget_ms(&mut self, budget_ms: i64) {
        self.set(HDR_TIME_BUDGET_MS, budget_ms.to_string());
    }

    /// Derive the child hop's time budget: `max(0, self.budget - overhead)`.
    /// Never increases the budget, satisfying the strictly-non-increasing
    /// invariant even when `overhead_ms` is zero.
    pub fn child_time_budget_ms(&self, overhead_ms: i64) -> i64 {
        (self.time_budget_ms() - overhead_ms).max(0)
    }

    /// The request/response operation code.
    pub fn op_code(&self) -> Option<OpCode> {
        self.get_one(HDR_OP_CODE).and_then(OpCode::from_str_ci)
    }

    /// Set the operation code.
    pub fn set_op_code(&mut self, code: OpCode) {
        self.set(HDR_OP_CODE, code.as_str().to_string());
    }

    /// Distributed trace parent, if any.
    pub fn trace_parent(&self) -> Option<&str> {
        self.get_one(HDR_TRACE_PARENT)
    }

    /// Set the trace parent.
    pub fn set_trace_parent(&mut self, value: impl Into<String>) {
        self.set(HDR_TRACE_PARENT, value);
    }

    /// Distributed trace state, if any.
    pub fn trace_state(&self) -> Option<&str> {
        self.get_one(HDR_TRACE_STATE)
    }

    /// Set the trace state.
    pub fn set_trace_state(&mut self, value: impl Into<String>) {
        self.set(HDR_TRACE_STATE, value);
    }

    /// The authenticated actor's claims, parsed as a JSON object.
    ///
    /// Returns `Ok(None)` if no actor header is set, `Err` if the header is
    /// present but not a JSON object.
    pub fn actor(&self) -> Result<Option<Value>, FrameError> {
        let Some(raw) = self.get_one(HDR_ACTOR) else {
            return Ok(None);
        };
        let value: Value = serde_json::from_str(raw).map_err(|_| FrameError::InvalidActor)?;
        if !value.is_object() {
            return Err(FrameError::InvalidActor);
        }
        Ok(Some(value))
    }

    /// Set the actor claims header from a JSON object.
    ///
    /// Callers must only invoke this after validating a token through a
    /// trusted validator (see the `Authorization` middleware) — the actor
    /// header must never be set from a raw, unauthenticated client header.
    pub fn set_actor(&mut self, claims: &Value) {
        self.set(HDR_ACTOR, claims.to_string());
    }

    /// Clear the actor claims. Used by the ingress to strip any
    /// client-supplied actor header before the request reaches middleware.
    pub fn clear_actor(&mut self) {
        self.del(HDR_ACTOR);
    }

    /// Locality tags, most-specific first.
    pub fn locality(&self) -> &[String] {
        self.get(HDR_LOCALITY).unwrap_or(&[])
    }

    /// Append a locality tag (most-specific last-added wins first position
    /// only if callers add tags in most-specific-first order, per the
    /// documented convention).
    pub fn add_locality(&mut self, tag: impl Into<String>) {
        self.add(HDR_LOCALITY, tag);
    }

    /// The synthesized `X-Forwarded-Host` value.
    pub fn x_forwarded_host(&self) -> Option<&str> {
        self.get_one(HDR_X_FORWARDED_HOST)
    }

    /// Set `X-Forwarded-Host`.
    pub fn set_x_forwarded_host(&mut self, host: impl Into<String>) {
        self.set(HDR_X_FORWARDED_HOST, host);
    }

    /// The preserved `X-Forwarded-Prefix` value, if any.
    pub fn x_forwarded_prefix(&self) -> Option<&str> {
        self.get_one(HDR_X_FORWARDED_PREFIX)
    }

    /// Set `X-Forwarded-Prefix`.
    pub fn set_x_forwarded_prefix(&mut self, prefix: impl Into<String>) {
        self.set(HDR_X_FORWARDED_PREFIX, prefix);
    }

    /// The synthesized `X-Forwarded-Proto` value.
    pub fn x_forwarded_proto(&self) -> Option<&str> {
        self.get_one(HDR_X_FORWARDED_PROTO)
    }

    /// Set `X-Forwarded-Proto`.
    pub fn set_x_forwarded_proto(&mut self, proto: impl Into<String>) {
        self.set(HDR_X_FORWARDED_PROTO, proto);
    }

    /// The synthesized `X-Forwarded-For` value.
    pub fn x_forwarded_for(&self) -> Option<&str> {
        self.get_one(HDR_X_FORWARDED_FOR)
    }

    /// Set `X-Forwarded-For`.
    pub fn set_x_forwarded_for(&mut self, addr: impl Into<String>) {
        self.set(HDR_X_FORWARDED_FOR, addr);
    }

    /// The synthesized `X-Forwarded-Path` value.
    pub fn x_forwarded_path(&self) -> Option<&str> {
        self.get_one(HDR_X_FORWARDED_PATH)
    }

    /// Set `X-Forwarded-Path`.
    pub fn set_x_forwarded_path(&mut self, path: impl Into<String>) {
        self.set(HDR_X_FORWARDED_PATH, path);
    }

    /// Reconstruct the full externally-visible URL this request arrived as,
    /// from the forwarded headers plus the path the ingress is about to
    /// dispatch. Used by middlewares (e.g. `ErrorPageRedirect`) that need
    /// the original client-facing URL rather than the internal one.
    pub fn x_forwarded_full_url(&self, fallback_path: &str) -> String {
        let proto = self.x_forwarded_proto().unwrap_or("http");
        let host = self.x_forwarded_host().unwrap_or("localhost");
        let prefix = self.x_forwarded_prefix().unwrap_or("");
        let path = self.x_forwarded_path().unwrap_or(fallback_path);
        format!("{proto}://{host}{prefix}{path}")
    }

    /// Build the child frame for an outbound call one hop down the causal
    /// chain: copies trace context, actor, and locality; assigns a fresh
    /// message id; increments call depth (capped at `max_depth`); and
    /// shortens the time budget by `overhead_ms`.
    pub fn child(
        &self,
        new_message_id: impl Into<String>,
        overhead_ms: i64,
        max_depth: u32,
    ) -> Result<Frame, FrameError> {
        let mut child = self.clone();
        child.set_message_id(new_message_id);
        child.increment_call_depth(max_depth)?;
        let budget = self.child_time_budget_ms(overhead_ms);
        child.set_time_budget_ms(budget);
        child.set_op_code(OpCode::Req);
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_get_set() {
        let mut f = Frame::new();
        f.set("X-Custom-Header", "value");
        assert_eq!(f.get_one("x-custom-header"), Some("value"));
        assert_eq!(f.get_one("X-CUSTOM-HEADER"), Some("value"));
    }

    #[test]
    fn call_depth_increments_and_caps() {
        let mut f = Frame::root("m1", 5_000);
        assert_eq!(f.call_depth(), 0);
        f.increment_call_depth(64).unwrap();
        assert_eq!(f.call_depth(), 1);
    }

    #[test]
    fn call_depth_overflow_is_fatal() {
        let mut f = Frame::root("m1", 5_000);
        f.set_call_depth(64);
        let err = f.increment_call_depth(64).unwrap_err();
        assert_eq!(err, FrameError::CallDepthExceeded(65, 64));
    }

    #[test]
    fn time_budget_never_increases() {
        let f = Frame::root("m1", 1_000);
        assert_eq!(f.child_time_budget_ms(0), 1_000);
        assert_eq!(f.child_time_budget_ms(100), 900);
        assert_eq!(f.child_time_budget_ms(5_000), 0);
    }

    #[test]
    fn child_frame_increments_depth_and_shortens_budget() {
        let root = Frame::root("m1", 1_000);
        let child = root.child("m2", 50, 64).unwrap();
        assert_eq!(child.call_depth(), 1);
        assert_eq!(child.time_budget_ms(), 950);
        assert_eq!(child.message_id(), Some("m2"));
    }

    #[test]
    fn child_frame_rejects_depth_overflow() {
        let mut root = Frame::root("m1", 1_000);
        root.set_call_depth(64);
        assert!(root.child("m2", 0, 64).is_err());
    }

    #[test]
    fn actor_round_trips_as_json_object() {
        let mut f = Frame::new();
        let claims = serde_json::json!({"roles": {"a": true}});
        f.set_actor(&claims);
        assert_eq!(f.actor().unwrap(), Some(claims));
    }

    #[test]
    fn actor_rejects_non_object_json() {
        let mut f = Frame::new();
        f.set("x-fabric-actor", "\"not-an-object\"");
        assert!(matches!(f.actor(), Err(FrameError::InvalidActor)));
    }

    #[test]
    fn strip_reserved_removes_only_prefixed_headers() {
        let mut f = Frame::new();
        f.set("x-fabric-actor", "{}");
        f.set("x-custom", "keep-me");
        f.strip_reserved();
        assert!(!f.has("x-fabric-actor"));
        assert!(f.has("x-custom"));
    }

    #[test]
    fn locality_preserves_insertion_order() {
        let mut f = Frame::new();
        f.add_locality("rack-1");
        f.add_locality("dc-east");
        assert_eq!(f.locality(), &["rack-1".to_string(), "dc-east".to_string()]);
    }

    #[test]
    fn forwarded_full_url_composes_from_parts() {
        let mut f = Frame::new();
        f.set_x_forwarded_proto("https");
        f.set_x_forwarded_host("example.com");
        f.set_x_forwarded_prefix("/api");
        assert_eq!(
            f.x_forwarded_full_url("/widgets/1"),
            "https://example.com/api/widgets/1"
        );
    }
}
