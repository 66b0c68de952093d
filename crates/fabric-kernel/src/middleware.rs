//! The HTTP-shaped request/response pair and the named, CRUD-mutable
//! middleware chain that wraps a terminal handler around them.

use crate::frame::Frame;
use futures::future::BoxFuture;
use std::sync::Arc;

/// An HTTP-shaped request as it flows through a middleware chain.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Frame,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            query: String::new(),
            headers: Frame::new(),
            body: Vec::new(),
        }
    }
}

/// An HTTP-shaped response as recorded by a handler and unwound back
/// through the chain.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: Frame,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Frame::new(),
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// The terminal or composed handler a middleware wraps: an owned, boxed
/// async function from request to response.
pub type Handler = Arc<dyn Fn(Request) -> BoxFuture<'static, Response> + Send + Sync>;

/// A named wrapper: given the next handler in the chain, produce a new
/// handler that may inspect/modify the request before calling `next` and
/// the response after.
pub type Wrapper = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// A middleware entry: a case-insensitively-unique name plus its wrapper.
pub trait Middleware: Send + Sync {
    /// The name this middleware is registered under.
    fn name(&self) -> &str;
    /// Build the wrapper this middleware contributes to the chain.
    fn wrapper(&self) -> Wrapper;
}

/// An ordered sequence of `(name, wrapper)` pairs, composed right-to-left:
/// `handler' = w_1(w_2(...w_n(handler)))`. Names are unique and compared
/// case-insensitively. All operations are O(n).
///
/// Intended to be mutated only before startup and treated as immutable
/// thereafter; callers needing concurrent access wrap it in their own lock
/// (`fabric-runtime` uses a `tokio::sync::RwLock`).
#[derive(Default)]
pub struct MiddlewareChain {
    entries: Vec<(String, Wrapper)>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        let needle = name.to_ascii_lowercase();
        self.entries
            .iter()
            .position(|(n, _)| n.to_ascii_lowercase() == needle)
    }

    /// Add at the tail if `name` is unused; otherwise replace the existing
    /// entry's wrapper in place, keeping its position.
    pub fn append(&mut self, name: impl Into<String>, wrapper: Wrapper) {
        let name = name.into();
        if let Some(pos) = self.position(&name) {
            self.entries[pos] = (name, wrapper);
        } else {
            self.entries.push((name, wrapper));
        }
    }

    /// Add at the head if `name` is unused; otherwise move the existing
    /// entry to the head and replace its wrapper.
    pub fn prepend(&mut self, name: impl Into<String>, wrapper: Wrapper) {
        let name = name.into();
        if let Some(pos) = self.position(&name) {
            self.entries.remove(pos);
        }
        self.entries.insert(0, (name, wrapper));
    }

    /// Insert `(name, wrapper)` immediately before `pivot`. No-op if
    /// `pivot` is absent. Returns whether the insert happened.
    pub fn insert_before(&mut self, pivot: &str, name: impl Into<String>, wrapper: Wrapper) -> bool {
        if self.position(pivot).is_none() {
            return false;
        }
        let name = name.into();
        if let Some(existing) = self.position(&name) {
            self.entries.remove(existing);
        }
        let pos = self.position(pivot).expect("pivot still present");
        self.entries.insert(pos, (name, wrapper));
        true
    }

    /// Insert `(name, wrapper)` immediately after `pivot`. No-op if
    /// `pivot` is absent. Returns whether the insert happened.
    pub fn insert_after(&mut self, pivot: &str, name: impl Into<String>, wrapper: Wrapper) -> bool {
        let Some(pos) = self.position(pivot) else {
            return false;
        };
        let name = name.into();
        if let Some(existing) = self.position(&name) {
            self.entries.remove(existing);
        }
        let pos = self.position(pivot).expect("pivot still present");
        self.entries.insert(pos + 1, (name, wrapper));
        true
    }

    /// Replace the wrapper registered under `name`. No-op if absent.
    /// Returns whether the replace happened.
    pub fn replace(&mut self, name: &str, wrapper: Wrapper) -> bool {
        match self.position(name) {
            Some(pos) => {
                self.entries[pos].1 = wrapper;
                true
            }
            None => false,
        }
    }

    /// Remove the entry registered under `name`. No-op if absent. Returns
    /// whether anything was removed.
    pub fn delete(&mut self, name: &str) -> bool {
        match self.position(name) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Case-insensitive existence check.
    pub fn exists(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// `" -> "`-joined names in chain order.
    pub fn string(&self) -> String {
        self.entries
            .iter()
            .map(|(n, _)| n.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    /// Compose the chain around `terminal`: `w_1(w_2(...w_n(terminal)))`.
    pub fn build(&self, terminal: Handler) -> Handler {
        self.entries
            .iter()
            .rev()
            .fold(terminal, |next, (_, wrapper)| wrapper(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_wrapper(tag: &'static str) -> Wrapper {
        Arc::new(move |next: Handler| -> Handler {
            Arc::new(move |req: Request| {
                let next = next.clone();
                Box::pin(async move {
                    let mut resp = next(req).await;
                    resp.body.extend_from_slice(tag.as_bytes());
                    resp
                })
            })
        })
    }

    fn identity_wrapper() -> Wrapper {
        Arc::new(|next: Handler| next)
    }

    fn terminal() -> Handler {
        Arc::new(|_req: Request| Box::pin(async { Response::new(200) }))
    }

    #[test]
    fn chain_ordering_scenario() {
        let mut chain = MiddlewareChain::new();
        chain.append("10", identity_wrapper());
        chain.append("20", identity_wrapper());
        chain.insert_before("10", "5", identity_wrapper());
        chain.insert_after("10", "15", identity_wrapper());
        chain.delete("20");
        assert_eq!(chain.string(), "5 -> 10 -> 15");
    }

    #[test]
    fn append_then_delete_restores_prior_string() {
        let mut chain = MiddlewareChain::new();
        chain.append("a", identity_wrapper());
        let before = chain.string();
        chain.append("b", identity_wrapper());
        chain.delete("b");
        assert_eq!(chain.string(), before);
    }

    #[test]
    fn append_with_existing_name_replaces_in_place() {
        let mut chain = MiddlewareChain::new();
        chain.append("a", identity_wrapper());
        chain.append("b", identity_wrapper());
        chain.append("a", identity_wrapper());
        assert_eq!(chain.string(), "a -> b");
    }

    #[test]
    fn prepend_moves_existing_entry_to_head() {
        let mut chain = MiddlewareChain::new();
        chain.append("a", identity_wrapper());
        chain.append("b", identity_wrapper());
        chain.prepend("b", identity_wrapper());
        assert_eq!(chain.string(), "b -> a");
    }

    #[test]
    fn insert_before_and_after_are_no_ops_without_pivot() {
        let mut chain = MiddlewareChain::new();
        chain.append("a", identity_wrapper());
        assert!(!chain.insert_before("missing", "x", identity_wrapper()));
        assert!(!chain.insert_after("missing", "x", identity_wrapper()));
        assert_eq!(chain.string(), "a");
    }

    #[test]
    fn exists_is_case_insensitive() {
        let mut chain = MiddlewareChain::new();
        chain.append("Logger", identity_wrapper());
        assert!(chain.exists("logger"));
        assert!(chain.exists("LOGGER"));
    }

    #[tokio::test]
    async fn composition_is_right_fold_over_terminal() {
        let mut chain = MiddlewareChain::new();
        chain.append("outer", tag_wrapper("-outer"));
        chain.append("inner", tag_wrapper("-inner"));
        let handler = chain.build(terminal());
        let resp = handler(Request::new("GET", "/x")).await;
        assert_eq!(resp.body, b"-inner-outer");
    }

    #[test]
    fn replace_is_no_op_when_absent() {
        let mut chain = MiddlewareChain::new();
        assert!(!chain.replace("missing", identity_wrapper()));
    }
}
