//! Contracts for the fabric's transport and dispatch core.
//!
//! This crate defines the *shapes*, not the runtime: [`Frame`], [`Subject`],
//! the [`Bus`](bus::Bus) capability trait, the [`MiddlewareChain`], the actor
//! claims DSL, and the shared [`FabricError`] taxonomy. Concrete engines
//! (Publisher, Subscriber, an in-process `Bus`) live in `fabric-runtime`; the
//! HTTP-facing pieces (ingress, control plane, metrics collector) live in
//! `fabric-gateway`.
//!
//! # Architecture mapping
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 fabric-kernel  (this crate)                  │
//! │  Frame   Subject   Bus trait   MiddlewareChain   FabricError  │
//! └───────────────────────────┬────────────────────────────────--┘
//!                              │ depends on
//! ┌───────────────────────────▼───────────────────────────────────┐
//! │                   fabric-runtime                               │
//! │  Publisher   Subscriber   InProcessBus: impl Bus               │
//! └───────────────────────────┬───────────────────────────────────┘
//!                              │ depends on
//! ┌───────────────────────────▼───────────────────────────────────┐
//! │                   fabric-gateway                               │
//! │  HTTP ingress   control-plane endpoints   metrics collector    │
//! └─────────────────────────────────────────────────────────────--┘
//! ```

pub mod actor;
pub mod bus;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod middleware;
pub mod subject;

pub use actor::{Actor, ClaimsExpr};
pub use bus::{Bus, BusError, QueueGroup};
pub use endpoint::EndpointDefinition;
pub use error::{ErrorEnvelope, ErrorKind, FabricError};
pub use frame::{Frame, FrameError, OpCode, INTERNAL_HEADER_PREFIX};
pub use middleware::{Handler, Middleware, MiddlewareChain, Request, Response, Wrapper};
pub use subject::{Subject, SubjectError};
