//! The axum-based HTTP ingress: one listener per configured external port,
//! each running the same pipeline (blocked paths, CORS, memory admission,
//! port-mapping resolution, header sanitization, bus dispatch) ahead of the
//! configured built-in middleware chain.

use crate::config::GatewayConfig;
use crate::cors::{self, CorsDecision};
use crate::discovery::{self, DiscoveryHandle};
use crate::error::GatewayError;
use crate::favicon;
use crate::memory_budget::RequestMemoryBudget;
use crate::metrics_collector::MetricsRegistry;
use crate::middleware_builtins;
use crate::port_mapping;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::routing::get;
use axum::Router;
use fabric_kernel::bus::{Bus, BusError};
use fabric_kernel::frame::OpCode;
use fabric_kernel::middleware::{Handler, MiddlewareChain, Request as MwRequest};
use fabric_kernel::Frame;
use fabric_runtime::{Publisher, PublisherError, RequestOptions, Subscriber, SubscriptionHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Builds the default built-in middleware chain: `ErrorPageRedirect` wraps
/// `ErrorPrinter` so it observes the post-redaction status, with
/// `CharsetUTF8` innermost.
fn build_default_chain(config: &GatewayConfig) -> MiddlewareChain {
    let mut chain = MiddlewareChain::new();
    chain.append("ErrorPageRedirect", middleware_builtins::error_page_redirect(401, config.login_page.clone()));
    chain.append("ErrorPrinter", middleware_builtins::error_printer(true));
    chain.append("CharsetUTF8", middleware_builtins::charset_utf8());
    chain
}

/// One gateway instance: owns its bus identity (for the control plane and
/// discovery ping responder) and forwards resolved ingress requests onto
/// the bus via a [`Publisher`].
pub struct GatewayServer {
    config: GatewayConfig,
    bus: Arc<dyn Bus>,
    publisher: Arc<Publisher>,
    subscriber: Arc<Subscriber>,
    metrics: Arc<MetricsRegistry>,
    memory_budget: Arc<RequestMemoryBudget>,
    chain: Arc<RwLock<MiddlewareChain>>,
    control_plane_handles: Mutex<Vec<SubscriptionHandle>>,
    discovery_handle: Mutex<Option<DiscoveryHandle>>,
    host: String,
    instance_id: String,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, bus: Arc<dyn Bus>, host: impl Into<String>, version: impl Into<String>) -> Arc<Self> {
        let host = host.into();
        let instance_id = Uuid::new_v4().to_string();
        let publisher = Arc::new(Publisher::new(bus.clone()));
        let subscriber = Arc::new(Subscriber::new(bus.clone(), host.clone(), instance_id.clone(), version));
        let memory_budget = RequestMemoryBudget::new(config.request_memory_limit_mib);
        let chain = Arc::new(RwLock::new(build_default_chain(&config)));

        Arc::new(Self {
            config,
            bus,
            publisher,
            subscriber,
            metrics: Arc::new(MetricsRegistry::default()),
            memory_budget,
            chain,
            control_plane_handles: Mutex::new(Vec::new()),
            discovery_handle: Mutex::new(None),
            host,
            instance_id,
        })
    }

    /// Mutate the ingress middleware chain before [`start`](Self::start) is
    /// called; the chain is treated as read-only once serving begins.
    pub fn chain(&self) -> &Arc<RwLock<MiddlewareChain>> {
        &self.chain
    }

    fn build_app(self: &Arc<Self>, external_port: u16) -> Router {
        let state = IngressState { gateway: self.clone(), external_port };
        Router::new()
            .route("/favicon.ico", get(favicon_handler))
            .fallback(ingress_handler)
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CompressionLayer::new())
    }

    /// Register the control plane and discovery responder, then bind and
    /// serve every configured external port until the process exits.
    pub async fn start(self: Arc<Self>) -> Result<(), GatewayServerError> {
        let handles = crate::control_plane::register(&self.subscriber, self.metrics.clone()).await?;
        *self.control_plane_handles.lock().await = handles;

        let discovery_handle = discovery::register(self.bus.clone(), self.host.clone(), self.instance_id.clone()).await?;
        *self.discovery_handle.lock().await = Some(discovery_handle);

        let mut listeners = Vec::new();
        for &port in &self.config.ports {
            let app = self.build_app(port);
            let addr = format!("0.0.0.0:{port}");
            info!(addr = %addr, "fabric gateway listening");
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            listeners.push((listener, app));
        }

        let servers = listeners.into_iter().map(|(listener, app)| {
            tokio::spawn(async move {
                if let Err(err) = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await {
                    warn!(%err, "gateway listener terminated");
                }
            })
        });
        for server in servers {
            let _ = server.await;
        }
        Ok(())
    }
}

#[derive(Clone)]
struct IngressState {
    gateway: Arc<GatewayServer>,
    external_port: u16,
}

async fn favicon_handler() -> impl IntoResponse {
    ([("content-type", favicon::FAVICON_CONTENT_TYPE)], favicon::FAVICON_BYTES)
}

/// Map a failed bus call to an HTTP response. Peer-rendered error envelopes
/// pass through verbatim; locally-originated failures route through the
/// same `error_response`/`error_printer` mechanism as a business handler's
/// own errors.
fn publisher_error_to_response(err: PublisherError) -> fabric_kernel::middleware::Response {
    use fabric_kernel::error::FabricError;
    match err {
        PublisherError::PeerError(status, body) => {
            let mut response = fabric_kernel::middleware::Response::new(status).with_body(body.into_bytes());
            response.headers.set("content-type", "application/json");
            response
        }
        PublisherError::NoResponder => {
            middleware_builtins::error_response(&FabricError::no_responder("no peer is subscribed to this route"))
        }
        PublisherError::TimeBudgetExceeded => {
            middleware_builtins::error_response(&FabricError::deadline_exceeded("request exceeded its time budget"))
        }
        other => middleware_builtins::error_response(&FabricError::internal(other.to_string())),
    }
}

fn terminal_handler(publisher: Arc<Publisher>, host: String, port: u16) -> Handler {
    Arc::new(move |req: MwRequest| {
        let publisher = publisher.clone();
        let host = host.clone();
        Box::pin(async move {
            let opts = RequestOptions::new(host, port, req.method.clone(), req.path.clone()).with_bytes_body(req.body.clone());
            match publisher.request(&req.headers, opts).await {
                Ok(response) => response,
                Err(err) => publisher_error_to_response(err),
            }
        })
    })
}

/// Builds the caller frame an ingress request carries onto the bus:
/// external headers minus anything reserved, plus the synthesized
/// `X-Forwarded-*` set. `X-Forwarded-Prefix` is left untouched if the
/// client already set one.
fn build_caller_frame(time_budget_ms: i64, parts: &axum::http::request::Parts, peer: SocketAddr) -> Frame {
    let mut headers = Frame::new();
    for (name, value) in parts.headers.iter() {
        if let Ok(v) = value.to_str() {
            headers.add(name.as_str(), v);
        }
    }
    headers.strip_reserved();
    headers.set_message_id(Uuid::new_v4().to_string());
    headers.set_time_budget_ms(time_budget_ms);
    headers.set_op_code(OpCode::Req);

    let host = parts
        .headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let proto = parts.uri.scheme_str().unwrap_or("http");
    headers.set_x_forwarded_host(host);
    headers.set_x_forwarded_proto(proto);
    headers.set_x_forwarded_for(peer.ip().to_string());
    headers.set_x_forwarded_path(parts.uri.path());
    headers
}

async fn ingress_handler(
    State(state): State<IngressState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: axum::extract::Request,
) -> AxumResponse {
    let gateway = &state.gateway;
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();

    if gateway.config.blocked_paths.blocks(&path) {
        return GatewayError::BlockedPath.into_response();
    }

    let method = parts.method.as_str().to_string();
    let origin = parts.headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok());
    let cors_decision = cors::evaluate(&method, origin, &gateway.config.allowed_origins);
    if matches!(cors_decision, CorsDecision::Disallowed) {
        return GatewayError::CorsDisallowed.into_response();
    }
    if let CorsDecision::Preflight { echo_origin } = &cors_decision {
        return AxumResponse::builder()
            .status(204)
            .header("access-control-allow-origin", echo_origin)
            .body(Body::empty())
            .unwrap();
    }

    let content_length = parts
        .headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<i64>().ok());
    let mut guard = match gateway.memory_budget.try_admit(content_length.unwrap_or(0)) {
        Some(guard) => guard,
        None => return GatewayError::RequestTooLarge.into_response(),
    };

    let read_cap = gateway.memory_budget.threshold().max(0) as usize;
    let body_bytes = match axum::body::to_bytes(body, read_cap).await {
        Ok(bytes) => bytes,
        Err(_) => return GatewayError::RequestTooLarge.into_response(),
    };
    if content_length.is_none() && !guard.try_grow(body_bytes.len() as i64) {
        return GatewayError::RequestTooLarge.into_response();
    }

    let route = match port_mapping::resolve_internal_url(state.external_port, &path, &gateway.config.port_mappings) {
        Ok(Some(route)) => route,
        Ok(None) => return GatewayError::Unmapped.into_response(),
        Err(_) => return GatewayError::Unmapped.into_response(),
    };

    let headers = build_caller_frame(gateway.config.time_budget_ms, &parts, peer);
    let query = parts.uri.query().unwrap_or("").to_string();
    let mw_request = MwRequest { method, path: route.route.clone(), query, headers, body: body_bytes.to_vec() };

    let terminal = terminal_handler(gateway.publisher.clone(), route.host.clone(), route.port);
    let composed = { gateway.chain.read().await.build(terminal) };

    let started = Instant::now();
    let mut response = composed(mw_request).await;
    response.headers.strip_reserved();
    if let CorsDecision::Allowed { echo_origin } = &cors_decision {
        response.headers.set("access-control-allow-origin", echo_origin.clone());
    }
    gateway.metrics.record_request(&route.host, &parts.method.as_str().to_string(), response.status, started.elapsed());

    let mut builder = AxumResponse::builder().status(response.status);
    for (name, values) in response.headers.iter() {
        for value in values {
            builder = builder.header(name, value);
        }
    }
    builder.body(Body::from(response.body)).unwrap()
}
