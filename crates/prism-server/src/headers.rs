//! Trace-ID injection and security headers, applied to every response.

use axum::{
    http::{HeaderValue, Request, header::HeaderName},
    middleware::Next,
    response::Response,
};

use prism_core::TraceId;

pub const TRACE_HEADER: &str = "x-trace-id";

/// Fixed security headers written onto every response.
const SECURITY_HEADERS: &[(&str, &str)] = &[
    (
        "content-security-policy",
        "default-src 'self'; script-src 'self' 'unsafe-inline' 'unsafe-eval'; \
         style-src 'self' 'unsafe-inline'; img-src 'self' data:; connect-src 'self'",
    ),
    (
        "strict-transport-security",
        "max-age=31536000; includeSubDomains; preload",
    ),
    ("x-frame-options", "DENY"),
    ("x-content-type-options", "nosniff"),
    ("x-xss-protection", "1; mode=block"),
    ("referrer-policy", "strict-origin-when-cross-origin"),
];

/// Resolve the request's trace ID (reusing a plausible client-supplied one),
/// stash it in request extensions for handlers, and stamp it plus the
/// security headers onto the response.
pub async fn trace_and_security_headers(
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let incoming = req
        .headers()
        .get(TRACE_HEADER)
        .and_then(|v| v.to_str().ok());
    let trace_id = TraceId::from_header(incoming);
    req.extensions_mut().insert(trace_id.clone());

    let mut resp = next.run(req).await;

    let headers = resp.headers_mut();
    for (name, value) in SECURITY_HEADERS {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    if let Ok(value) = HeaderValue::from_str(trace_id.as_str()) {
        headers.insert(HeaderName::from_static(TRACE_HEADER), value);
    }

    resp
}

/// Pull the trace ID injected by the middleware; mints one for the rare
/// code path running outside it (direct handler tests).
pub fn trace_from_extensions(extensions: &axum::http::Extensions) -> TraceId {
    extensions.get::<TraceId>().cloned().unwrap_or_default()
}
