//! Built-in ingress middlewares, composed into the chain ahead of whatever
//! business middleware a service registers.

use fabric_kernel::error::{ErrorEnvelope, FabricError};
use fabric_kernel::middleware::{Handler, Request, Response, Wrapper};
use fabric_kernel::Frame;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// Internal marker header: a terminal handler sets this to carry an
/// un-redacted `ErrorEnvelope` through to [`error_printer`], which applies
/// redaction and standard error headers before the response leaves the
/// process. Never forwarded past the chain — the ingress strips it along
/// with every other reserved-prefix header.
pub const RAW_ERROR_HEADER: &str = "x-gateway-raw-error";

/// Build the `Response` a terminal dispatch handler returns for a
/// [`FabricError`]: an un-redacted envelope tagged for [`error_printer`].
pub fn error_response(err: &FabricError) -> Response {
    let body = serde_json::to_vec(&err.to_envelope()).unwrap_or_default();
    let mut response = Response::new(err.status_code()).with_body(body);
    response.headers.set(RAW_ERROR_HEADER, "1");
    response
}

/// Wraps `downstream`; when the response carries a raw error envelope,
/// renders it with redaction applied, sets `Cache-Control`, and rewrites
/// the outer status from the envelope's `statusCode`.
pub fn error_printer(redact: bool) -> Wrapper {
    Arc::new(move |next: Handler| -> Handler {
        Arc::new(move |req: Request| {
            let next = next.clone();
            Box::pin(async move {
                let mut response = next(req).await;
                if !response.headers.has(RAW_ERROR_HEADER) {
                    return response;
                }
                response.headers.del(RAW_ERROR_HEADER);
                let rendered = match serde_json::from_slice::<ErrorEnvelope>(&response.body) {
                    Ok(envelope) => envelope.render(redact),
                    Err(err) => {
                        warn!(%err, "malformed error envelope from downstream handler");
                        serde_json::json!({ "err": { "error": "internal server error", "statusCode": 500, "trace": "" } })
                    }
                };
                response.status = rendered
                    .get("err")
                    .and_then(|e| e.get("statusCode"))
                    .and_then(Value::as_u64)
                    .unwrap_or(500) as u16;
                response.body = serde_json::to_vec(&rendered).unwrap_or_default();
                response.headers.set("content-type", "application/json");
                response.headers.set("cache-control", "no-cache, no-store, max-age=0");
                response
            })
        })
    })
}

fn looks_like_browser_navigation(headers: &Frame) -> bool {
    let is_browser_ua = headers
        .get_one("user-agent")
        .map(|ua| ua.starts_with("Mozilla/"))
        .unwrap_or(false);
    // Absent fetch-metadata headers are treated as navigate/document.
    let mode_is_navigate = headers
        .get_one("sec-fetch-mode")
        .map(|m| m.eq_ignore_ascii_case("navigate"))
        .unwrap_or(true);
    let dest_is_document = headers
        .get_one("sec-fetch-dest")
        .map(|d| d.eq_ignore_ascii_case("document"))
        .unwrap_or(true);
    is_browser_ua && mode_is_navigate && dest_is_document
}

/// `ErrorPageRedirect(code, path)`: redirect browser top-level navigations
/// whose response status is `code` to `path?src=<escaped original path>`.
pub fn error_page_redirect(code: u16, login_path: impl Into<String>) -> Wrapper {
    let login_path = login_path.into();
    Arc::new(move |next: Handler| -> Handler {
        let login_path = login_path.clone();
        Arc::new(move |req: Request| {
            let next = next.clone();
            let login_path = login_path.clone();
            Box::pin(async move {
                let is_navigation = looks_like_browser_navigation(&req.headers);
                let original_path = req.path.clone();
                let response = next(req).await;
                if is_navigation && response.status == code {
                    let mut redirect = Response::new(307);
                    let escaped_path = percent_encoding::utf8_percent_encode(
                        &original_path,
                        percent_encoding::NON_ALPHANUMERIC,
                    );
                    redirect.headers.set("location", format!("{login_path}?src={escaped_path}"));
                    return redirect;
                }
                response
            })
        })
    })
}

/// Extracts a bearer token from the request as `Authorization(validator)`
/// would: `Authorization: Bearer <t>` takes priority over the `Authorization`
/// cookie fallback.
fn extract_bearer_token(headers: &Frame) -> Option<String> {
    if let Some(token) = headers.get_one("authorization").and_then(|v| v.strip_prefix("Bearer ")) {
        return Some(token.to_string());
    }
    headers.get_one("cookie").and_then(|cookie| parse_cookie_value(cookie, "Authorization"))
}

fn parse_cookie_value(cookie_header: &str, name: &str) -> Option<String> {
    cookie_header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

/// A token validator: `(token) -> Result<claims, err>`. `Ok(None)` means the
/// token was inspected but carries no claims to attach.
pub type AuthValidator =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<Option<Value>, FabricError>> + Send + Sync>;

/// `Authorization(validator)`: on a present bearer token, calls `validator`
/// and, when valid, writes its claims into the reserved actor header. The
/// ingress already strips any incoming actor header before this runs, so an
/// external caller can never forge one.
pub fn authorization(validator: AuthValidator) -> Wrapper {
    Arc::new(move |next: Handler| -> Handler {
        let validator = validator.clone();
        Arc::new(move |mut req: Request| {
            let next = next.clone();
            let validator = validator.clone();
            Box::pin(async move {
                if let Some(token) = extract_bearer_token(&req.headers) {
                    match validator(token).await {
                        Ok(Some(claims)) => req.headers.set_actor(&claims),
                        Ok(None) => {}
                        Err(err) => warn!(%err, "authorization validator rejected the request"),
                    }
                }
                next(req).await
            })
        })
    })
}

/// `CharsetUTF8`: appends `; charset=utf-8` to the response `Content-Type`
/// when it is `application/json` or `text/*` with no existing parameter.
pub fn charset_utf8() -> Wrapper {
    Arc::new(|next: Handler| -> Handler {
        Arc::new(move |req: Request| {
            let next = next.clone();
            Box::pin(async move {
                let mut response = next(req).await;
                if let Some(content_type) = response.headers.get_one("content-type") {
                    let needs_charset = !content_type.contains(';')
                        && (content_type == "application/json" || content_type.starts_with("text/"));
                    if needs_charset {
                        response.headers.set("content-type", format!("{content_type}; charset=utf-8"));
                    }
                }
                response
            })
        })
    })
}

/// `RootPath(rootPath)`: rewrites request path `/` to `/<rootPath>` before
/// downstream, and rewrites a response `Location:` pointing back at
/// `/<rootPath>` to `/`.
pub fn root_path(root_path: impl Into<String>) -> Wrapper {
    let rewritten = format!("/{}", root_path.into().trim_start_matches('/'));
    Arc::new(move |next: Handler| -> Handler {
        let rewritten = rewritten.clone();
        Arc::new(move |mut req: Request| {
            let next = next.clone();
            let rewritten = rewritten.clone();
            Box::pin(async move {
                if req.path == "/" {
                    req.path = rewritten.clone();
                }
                let mut response = next(req).await;
                if response.headers.get_one("location") == Some(rewritten.as_str()) {
                    response.headers.set("location", "/");
                }
                response
            })
        })
    })
}

/// `OnRoutePrefix(prefix, inner)`: applies `inner` only when the request
/// path starts with `prefix`.
pub fn on_route_prefix(prefix: impl Into<String>, inner: Wrapper) -> Wrapper {
    let prefix = prefix.into();
    Arc::new(move |next: Handler| -> Handler {
        let wrapped = inner(next.clone());
        let prefix = prefix.clone();
        Arc::new(move |req: Request| {
            if req.path.starts_with(prefix.as_str()) {
                wrapped(req)
            } else {
                next(req)
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_terminal() -> Handler {
        Arc::new(|_req: Request| Box::pin(async { Response::new(200).with_body(b"ok".to_vec()) }))
    }

    fn failing_terminal(err: FabricError) -> Handler {
        Arc::new(move |_req: Request| {
            let err = err.clone();
            Box::pin(async move { error_response(&err) })
        })
    }

    #[tokio::test]
    async fn error_printer_renders_redacted_5xx() {
        let handler = error_printer(true)(failing_terminal(FabricError::internal("disk is on fire")));
        let response = handler(Request::new("GET", "/x")).await;
        assert_eq!(response.status, 500);
        let body: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["err"]["error"], "internal server error");
        assert!(!response.headers.has(RAW_ERROR_HEADER));
    }

    #[tokio::test]
    async fn error_printer_preserves_4xx_message() {
        let handler = error_printer(true)(failing_terminal(FabricError::not_found("widget missing")));
        let response = handler(Request::new("GET", "/x")).await;
        assert_eq!(response.status, 404);
        let body: Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["err"]["error"], "widget missing");
    }

    #[tokio::test]
    async fn error_printer_passes_through_non_error_responses() {
        let handler = error_printer(true)(ok_terminal());
        let response = handler(Request::new("GET", "/x")).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"ok");
    }

    #[tokio::test]
    async fn error_page_redirect_sends_browsers_to_login() {
        let inner = error_printer(true)(failing_terminal(FabricError::unauthorized("no token")));
        let handler = error_page_redirect(401, "/login-page")(inner);
        let mut req = Request::new("GET", "/original/path");
        req.headers.set("user-agent", "Mozilla/5.0");
        req.headers.set("sec-fetch-mode", "navigate");
        req.headers.set("sec-fetch-dest", "document");
        let response = handler(req).await;
        assert_eq!(response.status, 307);
        assert_eq!(response.headers.get_one("location"), Some("/login-page?src=%2Foriginal%2Fpath"));
    }

    #[tokio::test]
    async fn error_page_redirect_passes_through_non_browser_requests() {
        let inner = error_printer(true)(failing_terminal(FabricError::unauthorized("no token")));
        let handler = error_page_redirect(401, "/login-page")(inner);
        let mut req = Request::new("GET", "/original/path");
        req.headers.set("user-agent", "curl/8.0");
        let response = handler(req).await;
        assert_eq!(response.status, 401);
        assert!(response.headers.get_one("location").is_none());
    }

    #[tokio::test]
    async fn charset_utf8_appends_to_bare_json_content_type() {
        let handler = charset_utf8()(Arc::new(|_req: Request| {
            Box::pin(async {
                let mut response = Response::new(200);
                response.headers.set("content-type", "application/json");
                response
            })
        }));
        let response = handler(Request::new("GET", "/x")).await;
        assert_eq!(response.headers.get_one("content-type"), Some("application/json; charset=utf-8"));
    }

    #[tokio::test]
    async fn charset_utf8_does_not_touch_parameterized_content_type() {
        let handler = charset_utf8()(Arc::new(|_req: Request| {
            Box::pin(async {
                let mut response = Response::new(200);
                response.headers.set("content-type", "text/plain; charset=iso-8859-1");
                response
            })
        }));
        let response = handler(Request::new("GET", "/x")).await;
        assert_eq!(response.headers.get_one("content-type"), Some("text/plain; charset=iso-8859-1"));
    }

    #[tokio::test]
    async fn root_path_rewrites_slash_and_unwinds_location() {
        let handler = root_path("app")(Arc::new(|req: Request| {
            Box::pin(async move {
                let mut response = Response::new(302);
                response.headers.set("location", req.path.clone());
                response
            })
        }));
        let response = handler(Request::new("GET", "/")).await;
        assert_eq!(response.headers.get_one("location"), Some("/"));
    }

    #[tokio::test]
    async fn on_route_prefix_applies_inner_only_within_prefix() {
        let tag: Wrapper = Arc::new(|next: Handler| -> Handler {
            Arc::new(move |req: Request| {
                let next = next.clone();
                Box::pin(async move {
                    let mut response = next(req).await;
                    response.body.extend_from_slice(b"-tagged");
                    response
                })
            })
        });
        let terminal: Handler = Arc::new(|_req: Request| Box::pin(async { Response::new(200) }));
        let handler = on_route_prefix("/admin", tag)(terminal);

        let inside = handler(Request::new("GET", "/admin/x")).await;
        assert_eq!(inside.body, b"-tagged");

        let outside = handler(Request::new("GET", "/public/x")).await;
        assert!(outside.body.is_empty());
    }
}
