//! The Publisher/Subscriber engines and the in-process `Bus` implementation
//! built on top of `fabric-kernel`'s contracts.

pub mod bus;
pub mod pending;
pub mod publisher;
pub mod subscriber;

pub use bus::InProcessBus;
pub use pending::{Multiplicity, PendingRequest, PendingRequestMap};
pub use publisher::{Body, Publisher, PublisherConfig, PublisherError, RequestOptions, ResponseStream};
pub use subscriber::{Subscriber, SubscriberConfig, SubscriptionHandle};
