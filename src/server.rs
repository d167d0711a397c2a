//! HTTP server: metrics, health checks, the application status API and the
//! git webhook receiver

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::metrics;
use crate::model::ManagedApp;
use crate::registry::RegistryHandle;

/// Largest accepted webhook payload
const MAX_BODY_BYTES: usize = 1024 * 1024;

const APPLICATIONS_PREFIX: &str = "/api/v1/applications";

/// Serve HTTP on `port` until the task is dropped
pub async fn serve(port: u16, registry: RegistryHandle) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    // Set initial health
    metrics::OPERATOR_HEALTH.set(1.0);

    let registry = Arc::new(registry);
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let registry = registry.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(req, registry.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

/// Route one request
pub async fn handle_request(
    req: Request<Incoming>,
    registry: Arc<RegistryHandle>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().trim_end_matches('/').to_string();
    let namespace = query_param(req.uri().query(), "namespace");
    debug!(method = %method, path = %path, "HTTP request");

    let response = match (method, path.as_str()) {
        (Method::GET, "/metrics") => metrics_response(),
        (Method::GET, "/healthz") | (Method::GET, "/health") => health_response(),
        (Method::GET, "/readyz") | (Method::GET, "/ready") => ready_response(),
        (Method::GET, APPLICATIONS_PREFIX) => list_applications(&registry, namespace.as_deref()),
        (Method::POST, "/api/v1/webhook/git") => git_webhook(req, &registry).await,
        (method, path) => match path.strip_prefix(APPLICATIONS_PREFIX) {
            Some(rest) => application_route(method, rest, namespace.as_deref(), &registry).await,
            None => not_found_response(),
        },
    };

    Ok(response)
}

async fn application_route(
    method: Method,
    rest: &str,
    namespace: Option<&str>,
    registry: &RegistryHandle,
) -> Response<Full<Bytes>> {
    let segments: Vec<&str> = rest.trim_start_matches('/').split('/').collect();
    match (method, segments.as_slice()) {
        (Method::GET, [name]) if !name.is_empty() => match resolve(registry, name, namespace) {
            Ok(app) => json_response(StatusCode::OK, &application_json(registry, &app)),
            Err(response) => response,
        },
        (Method::POST, [name, "sync"]) => match resolve(registry, name, namespace) {
            Ok(app) => match registry.sync_now(&app.id()).await {
                Ok(true) => {
                    info!(app = %app.id(), "Sync requested over HTTP");
                    json_response(StatusCode::ACCEPTED, &json!({ "queued": true, "application": app.id() }))
                }
                Ok(false) => error_response(StatusCode::NOT_FOUND, "application is not running"),
                Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
            },
            Err(response) => response,
        },
        _ => not_found_response(),
    }
}

/// Find exactly one registered application by name
fn resolve(
    registry: &RegistryHandle,
    name: &str,
    namespace: Option<&str>,
) -> std::result::Result<Arc<ManagedApp>, Response<Full<Bytes>>> {
    let mut found = registry.find_by_name(name, namespace);
    match found.len() {
        0 => Err(error_response(
            StatusCode::NOT_FOUND,
            &format!("application '{}' not found", name),
        )),
        1 => Ok(found.remove(0)),
        _ => Err(error_response(
            StatusCode::CONFLICT,
            &format!(
                "application name '{}' exists in several namespaces, add ?namespace=",
                name
            ),
        )),
    }
}

fn list_applications(registry: &RegistryHandle, namespace: Option<&str>) -> Response<Full<Bytes>> {
    let snapshot = registry.snapshot();
    let mut apps: Vec<&Arc<ManagedApp>> = snapshot
        .values()
        .filter(|app| namespace.map_or(true, |ns| app.namespace == ns))
        .collect();
    apps.sort_by_key(|app| app.id());
    let items: Vec<Value> = apps
        .into_iter()
        .map(|app| application_json(registry, app))
        .collect();
    json_response(StatusCode::OK, &json!({ "items": items }))
}

fn application_json(registry: &RegistryHandle, app: &ManagedApp) -> Value {
    json!({
        "name": app.name,
        "namespace": app.namespace,
        "source": {
            "repoURL": app.source.repo_url,
            "path": app.source.path,
            "targetRevision": app.source.target_revision,
        },
        "destination": {
            "server": app.destination.server,
            "namespace": app.destination.namespace,
        },
        "syncPolicy": {
            "automated": app.policy.automated,
            "prune": app.policy.prune,
            "selfHeal": app.policy.self_heal,
            "syncIntervalSeconds": app.policy.sync_interval.as_secs(),
        },
        "status": registry.board().get(&app.id()),
    })
}

/// Accept a push notification and queue cycles for matching applications
async fn git_webhook(req: Request<Incoming>, registry: &RegistryHandle) -> Response<Full<Bytes>> {
    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "Failed to read webhook body");
            return error_response(StatusCode::BAD_REQUEST, "unreadable body");
        }
    };
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)),
    };

    let urls = repository_urls(&payload);
    if urls.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "payload has no repository URL");
    }

    let mut notified = 0;
    for url in &urls {
        match registry.notify_source(url).await {
            Ok(count) => notified += count,
            Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
        }
    }
    info!(repositories = ?urls, notified = notified, "Git webhook received");
    json_response(StatusCode::ACCEPTED, &json!({ "notified": notified }))
}

/// Repository URLs named by a push payload
pub fn repository_urls(payload: &Value) -> Vec<String> {
    let mut urls: Vec<String> = ["clone_url", "html_url", "url"]
        .iter()
        .filter_map(|field| payload.pointer(&format!("/repository/{}", field)))
        .filter_map(Value::as_str)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect();
    urls.dedup();
    urls
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

/// Generate metrics response
fn metrics_response() -> Response<Full<Bytes>> {
    match metrics::encode() {
        Ok((buffer, format)) => {
            let mut response = Response::new(Full::new(Bytes::from(buffer)));
            if let Ok(value) = HeaderValue::from_str(&format) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
        }
    }
}

/// Health check response
fn health_response() -> Response<Full<Bytes>> {
    text_response(StatusCode::OK, "ok")
}

/// Readiness check response
fn ready_response() -> Response<Full<Bytes>> {
    if metrics::OPERATOR_HEALTH.get() >= 1.0 {
        text_response(StatusCode::OK, "ok")
    } else {
        text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Not found response
fn not_found_response() -> Response<Full<Bytes>> {
    text_response(StatusCode::NOT_FOUND, "Not Found")
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

fn json_response(status: StatusCode, body: &Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &json!({ "error": message }))
}
