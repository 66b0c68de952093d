//! The reserved control-plane subjects, always on port 888:
//! `ping`, `config-refresh`, `trace`, `metrics`, and the outbound
//! `on-new-subs` event.

use fabric_kernel::endpoint::EndpointDefinition;
use fabric_kernel::middleware::{Handler, MiddlewareChain, Request, Response};
use fabric_runtime::{Publisher, PublisherError, RequestOptions, Subscriber, SubscriptionHandle};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::metrics_collector::MetricsRegistry;

/// The control plane's reserved internal port.
pub const CONTROL_PLANE_PORT: u16 = 888;

fn empty_chain() -> RwLock<MiddlewareChain> {
    RwLock::new(MiddlewareChain::new())
}

fn json_handler<F>(f: F) -> Handler
where
    F: Fn(Request) -> serde_json::Value + Send + Sync + 'static,
{
    Arc::new(move |req: Request| {
        let body = serde_json::to_vec(&f(req)).unwrap_or_default();
        Box::pin(async move { Response::new(200).with_body(body) })
    })
}

/// Register the always-on control-plane endpoints for one service instance.
/// `metrics` renders the Prometheus exposition text for this instance.
pub async fn register(
    subscriber: &Arc<Subscriber>,
    metrics: Arc<MetricsRegistry>,
) -> Result<Vec<SubscriptionHandle>, fabric_kernel::bus::BusError> {
    let mut handles = Vec::new();

    let ping_chain = empty_chain();
    handles.push(
        subscriber
            .subscribe(
                CONTROL_PLANE_PORT,
                EndpointDefinition::new("ANY", "/ping").with_all_replicas(),
                &ping_chain,
                json_handler(|_req| json!({ "pong": 1 })),
            )
            .await?,
    );

    let config_refresh_chain = empty_chain();
    handles.push(
        subscriber
            .subscribe(
                CONTROL_PLANE_PORT,
                EndpointDefinition::new("ANY", "/config-refresh").with_all_replicas(),
                &config_refresh_chain,
                json_handler(|_req| json!({})),
            )
            .await?,
    );

    let trace_chain = empty_chain();
    handles.push(
        subscriber
            .subscribe(
                CONTROL_PLANE_PORT,
                EndpointDefinition::new("ANY", "/trace").with_all_replicas(),
                &trace_chain,
                json_handler(|_req| json!({})),
            )
            .await?,
    );

    let metrics_chain = empty_chain();
    let metrics_for_handler = metrics.clone();
    let metrics_handler: Handler = Arc::new(move |_req: Request| {
        let metrics = metrics_for_handler.clone();
        Box::pin(async move {
            let text = metrics.render();
            let mut response = Response::new(200).with_body(text.into_bytes());
            response.headers.set("content-type", "text/plain; version=0.0.4");
            response
        })
    });
    handles.push(
        subscriber
            .subscribe(
                CONTROL_PLANE_PORT,
                EndpointDefinition::new("ANY", "/metrics").with_all_replicas(),
                &metrics_chain,
                metrics_handler,
            )
            .await?,
    );

    Ok(handles)
}

/// Fire the outbound `POST /on-new-subs` event to every host that asked to
/// be told about newly registered subscriptions.
pub async fn notify_new_subscriptions(
    publisher: &Publisher,
    caller_frame: &fabric_kernel::Frame,
    hosts: &[String],
) -> Result<(), PublisherError> {
    let body = json!({ "hosts": hosts });
    for host in hosts {
        let opts = RequestOptions::new(host, CONTROL_PLANE_PORT, "POST", "/on-new-subs").with_json_body(body.clone());
        let _ = publisher.request(caller_frame, opts).await;
    }
    Ok(())
}
