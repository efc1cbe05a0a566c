//! HTTP server for the dashboard
//!
//! `netstat-dash serve` → binds, optionally opens the browser, serves the
//! embedded dashboard page and the JSON API:
//!
//! | Path | Handler |
//! |---|---|
//! | `/api/v1/connections/filters` | [`Store::filter_vocabulary`] |
//! | `/api/v1/connections` | [`Store::list_connections`] |
//! | `/api/v1/connections/stats` | [`Store::dimension_stats`] |
//! | `/api/v1/connections/stats/advanced` | [`Store::pair_stats`] |
//!
//! Routing is transport-independent ([`route`]) so it can be exercised
//! without a socket; [`start`] only adapts it to `tiny_http`.

use crate::config::{Config, SchemaCheck};
use crate::db::Store;
use crate::error::{ApiError, ServeError};
use crate::filter::{parse_limit, ConnectionFilter, Page, RawQuery, DEFAULT_PAGE_LIMIT, DEFAULT_PAIR_LIMIT};
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tiny_http::{Header, Method, Request, Response, Server};
use tracing::{debug, error, info, warn};

// Embed the UI directly in the binary
const UI_HTML: &str = include_str!("ui.html");

const CORS_HEADERS: &[(&str, &str)] = &[
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "GET, OPTIONS"),
    ("Access-Control-Allow-Headers", "Content-Type"),
];

#[derive(Serialize)]
struct ErrorBody {
    error: bool,
    message: String,
}

/// A fully rendered response, independent of the HTTP library.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub content_type: Option<&'static str>,
    pub body: String,
}

impl Reply {
    fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Self { status: 200, content_type: Some("application/json"), body },
            Err(e) => Self::error(500, &format!("failed to encode response: {}", e)),
        }
    }

    fn error(status: u16, message: &str) -> Self {
        let body = serde_json::to_string(&ErrorBody { error: true, message: message.to_string() })
            .unwrap_or_else(|_| r#"{"error":true,"message":"internal error"}"#.to_string());
        Self { status, content_type: Some("application/json"), body }
    }

    fn html(body: &str) -> Self {
        Self { status: 200, content_type: Some("text/html; charset=utf-8"), body: body.to_string() }
    }

    fn empty() -> Self {
        Self { status: 200, content_type: None, body: String::new() }
    }

    fn from_result<T: Serialize>(result: Result<T, ApiError>) -> Self {
        match result {
            Ok(value) => Self::json(&value),
            Err(e) => Self::error(e.status_code(), &e.to_string()),
        }
    }

    /// Response headers: the content type, if any, then the CORS set.
    pub fn headers(&self) -> Vec<(&'static str, &'static str)> {
        let mut headers = Vec::with_capacity(CORS_HEADERS.len() + 1);
        if let Some(content_type) = self.content_type {
            headers.push(("Content-Type", content_type));
        }
        headers.extend_from_slice(CORS_HEADERS);
        headers
    }
}

/// Shared request context: the store and when to check its structure.
pub struct App {
    store: Store,
    schema_check: SchemaCheck,
}

impl App {
    pub fn new(store: Store, schema_check: SchemaCheck) -> Self {
        Self { store, schema_check }
    }

    /// The store, re-verified first when checking per request.
    fn store(&self) -> Result<&Store, ApiError> {
        if self.schema_check == SchemaCheck::Request {
            self.store.verify_schema()?;
        }
        Ok(&self.store)
    }
}

/// Start server, open browser, serve UI
pub fn start(config: &Config, store: Store, open_browser: bool) -> Result<(), ServeError> {
    if config.schema_check == SchemaCheck::Startup {
        store.verify_schema()?;
        info!("table structure verified");
    }

    let addr = config.server.addr();
    let server = Server::http(&addr).map_err(|e| ServeError::Bind {
        addr: addr.clone(),
        reason: e.to_string(),
    })?;
    let server = Arc::new(server);
    let app = Arc::new(App::new(store, config.schema_check));

    let url = format!("http://{}", addr);
    let workers = config.server.workers.max(1);
    info!(%url, workers, "dashboard listening");

    if open_browser {
        if let Err(e) = open::that(&url) {
            warn!("could not open browser: {}", e);
        }
    }

    let mut handles = Vec::with_capacity(workers);
    for id in 0..workers {
        let server = Arc::clone(&server);
        let app = Arc::clone(&app);
        let handle = thread::Builder::new()
            .name(format!("http-worker-{}", id))
            .spawn(move || {
                for request in server.incoming_requests() {
                    if let Err(e) = handle_request(request, &app) {
                        error!("failed to respond: {}", e);
                    }
                }
            })?;
        handles.push(handle);
    }

    for handle in handles {
        if handle.join().is_err() {
            error!("worker thread panicked");
        }
    }

    Ok(())
}

fn handle_request(request: Request, app: &App) -> std::io::Result<()> {
    let started = Instant::now();
    let method = request.method().clone();
    let url = request.url().to_string();

    let reply = route(app, &method, &url);

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match reply.status {
        500..=599 => error!(%method, %url, status = reply.status, elapsed_ms, body = %reply.body, "request failed"),
        400..=499 => warn!(%method, %url, status = reply.status, elapsed_ms, "request rejected"),
        _ => debug!(%method, %url, status = reply.status, elapsed_ms, "request served"),
    }

    let headers = reply.headers();
    let mut response = Response::from_string(reply.body).with_status_code(reply.status);
    for (name, value) in headers {
        if let Some(h) = header(name, value) {
            response.add_header(h);
        }
    }

    request.respond(response)
}

fn header(name: &str, value: &str) -> Option<Header> {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
}

/// Map a request line to a reply.
pub fn route(app: &App, method: &Method, url: &str) -> Reply {
    let path = url.split('?').next().unwrap_or("/");
    let path = match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };

    match (method, path) {
        // Pre-flight
        (&Method::Options, _) => Reply::empty(),

        (&Method::Get, "/") | (&Method::Get, "/index.html") => Reply::html(UI_HTML),

        (&Method::Get, "/api/v1/connections/filters") => Reply::from_result(filters(app)),
        (&Method::Get, "/api/v1/connections") => Reply::from_result(connections(app, url)),
        (&Method::Get, "/api/v1/connections/stats") => Reply::from_result(stats(app, url)),
        (&Method::Get, "/api/v1/connections/stats/advanced") => Reply::from_result(advanced_stats(app, url)),

        (&Method::Get, _) => Reply::error(404, &format!("not found: {}", path)),
        _ => Reply::error(405, &format!("method {} not allowed", method)),
    }
}

fn filters(app: &App) -> Result<crate::db::FilterVocabulary, ApiError> {
    Ok(app.store()?.filter_vocabulary()?)
}

fn connections(app: &App, url: &str) -> Result<crate::db::ConnectionPage, ApiError> {
    let raw = RawQuery::from_url(url)?;
    let filter = ConnectionFilter::from_query(&raw)?;
    let page = Page::from_query(&raw, DEFAULT_PAGE_LIMIT)?;
    Ok(app.store()?.list_connections(&filter, page)?)
}

fn stats(app: &App, url: &str) -> Result<crate::db::DimensionStats, ApiError> {
    let raw = RawQuery::from_url(url)?;
    let filter = ConnectionFilter::from_query(&raw)?;
    Ok(app.store()?.dimension_stats(&filter)?)
}

fn advanced_stats(app: &App, url: &str) -> Result<crate::db::PairStats, ApiError> {
    let raw = RawQuery::from_url(url)?;
    let filter = ConnectionFilter::from_query(&raw)?;
    let limit = parse_limit(&raw, DEFAULT_PAIR_LIMIT)?;
    Ok(app.store()?.pair_stats(&filter, limit)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewObservation;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn app_with(rows: &[(&str, &str, &str, i32)], check: SchemaCheck) -> (TempDir, App) {
        let dir = TempDir::new().unwrap();
        let store = Store::open_at(dir.path().join("serve.db"), 2).unwrap();
        store.migrate().unwrap();
        let rows: Vec<NewObservation> = rows
            .iter()
            .map(|(ts, server, remote, port)| NewObservation {
                timestamp: ts.to_string(),
                local_ip: "192.168.0.10".to_string(),
                remote_ip: remote.to_string(),
                port: *port,
                state: "ESTABLISHED".to_string(),
                servername: server.to_string(),
                file_date: ts[..10].to_string(),
            })
            .collect();
        store.insert_observations(&rows).unwrap();
        (dir, App::new(store, check))
    }

    fn scenario_app() -> (TempDir, App) {
        app_with(
            &[
                ("2024-01-01 10:00:00", "A", "1.1.1.1", 80),
                ("2024-01-02 10:00:00", "A", "2.2.2.2", 80),
                ("2024-01-03 10:00:00", "B", "1.1.1.1", 443),
            ],
            SchemaCheck::Startup,
        )
    }

    fn get(app: &App, url: &str) -> (u16, Value) {
        let reply = route(app, &Method::Get, url);
        let body = serde_json::from_str(&reply.body).unwrap();
        (reply.status, body)
    }

    // ==========================================================================
    // EMPTY STORE TESTS
    // ==========================================================================

    #[test]
    fn test_filters_on_empty_store() {
        let (_dir, app) = app_with(&[], SchemaCheck::Startup);
        let (status, body) = get(&app, "/api/v1/connections/filters");
        assert_eq!(status, 200);
        assert_eq!(body, json!({"servers": [], "localIps": [], "remoteIps": [], "ports": []}));
    }

    #[test]
    fn test_listing_on_empty_store() {
        let (_dir, app) = app_with(&[], SchemaCheck::Startup);
        let (status, body) = get(&app, "/api/v1/connections?page=1&limit=10");
        assert_eq!(status, 200);
        assert_eq!(body, json!({"connections": [], "total": 0, "page": 1, "limit": 10, "pages": 0}));
    }

    // ==========================================================================
    // ENDPOINT SHAPE TESTS
    // ==========================================================================

    #[test]
    fn test_listing_row_shape() {
        let (_dir, app) = scenario_app();
        let (status, body) = get(&app, "/api/v1/connections?servers=B");
        assert_eq!(status, 200);
        assert_eq!(body["total"], 1);
        assert_eq!(body["pages"], 1);
        assert_eq!(
            body["connections"][0],
            json!({
                "id": 3,
                "timestamp": "2024-01-03 10:00:00",
                "server": "B",
                "localIp": "192.168.0.10",
                "remoteIp": "1.1.1.1",
                "port": 443,
                "status": "ESTABLISHED"
            })
        );
    }

    #[test]
    fn test_stats_shape_and_scenario() {
        let (_dir, app) = scenario_app();
        let (status, body) = get(&app, "/api/v1/connections/stats?servers=A");
        assert_eq!(status, 200);
        assert_eq!(body["server"], json!([{"value": "A", "count": 2}]));
        assert_eq!(body["port"], json!([{"value": 80, "count": 2}]));
        let remote = body["remoteIp"].as_array().unwrap();
        assert_eq!(remote.len(), 2);
        assert!(remote.iter().all(|c| c["count"] == 1));
    }

    #[test]
    fn test_advanced_stats_shape() {
        let (_dir, app) = scenario_app();
        let (status, body) = get(&app, "/api/v1/connections/stats/advanced?limit=1&ports=80");
        assert_eq!(status, 200);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"][0]["server"], "A");
        assert!(body["data"][0].get("remote_ip").is_some());
        assert_eq!(body["servers"], json!(["A", "B"]));
    }

    #[test]
    fn test_listing_total_matches_stats_sum() {
        let (_dir, app) = scenario_app();
        let (_, listing) = get(&app, "/api/v1/connections?ports=80,443&remoteIp=1.1.1.1");
        let (_, stats) = get(&app, "/api/v1/connections/stats?ports=80,443&remoteIp=1.1.1.1");
        let sum: i64 = stats["server"].as_array().unwrap().iter().map(|c| c["count"].as_i64().unwrap()).sum();
        assert_eq!(listing["total"].as_i64().unwrap(), sum);
        assert_eq!(sum, 2);
    }

    #[test]
    fn test_trailing_slash_is_accepted() {
        let (_dir, app) = scenario_app();
        let (status, body) = get(&app, "/api/v1/connections/?ports=80");
        assert_eq!(status, 200);
        assert_eq!(body["total"], 2);
    }

    // ==========================================================================
    // ERROR TESTS
    // ==========================================================================

    #[test]
    fn test_bad_port_is_400() {
        let (_dir, app) = scenario_app();
        let (status, body) = get(&app, "/api/v1/connections?ports=80,http");
        assert_eq!(status, 400);
        assert_eq!(body["error"], true);
        assert!(body["message"].as_str().unwrap().contains("http"));
    }

    #[test]
    fn test_huge_limit_is_one_page() {
        let (_dir, app) = scenario_app();
        let (status, body) = get(&app, "/api/v1/connections?limit=9223372036854775807");
        assert_eq!(status, 200);
        assert_eq!(body["total"], 3);
        assert_eq!(body["pages"], 1);
        assert_eq!(body["limit"], i64::MAX);
        assert_eq!(body["connections"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_zero_limit_is_400() {
        let (_dir, app) = scenario_app();
        let (status, _) = get(&app, "/api/v1/connections/stats/advanced?limit=0");
        assert_eq!(status, 400);
    }

    #[test]
    fn test_missing_table_per_request_is_500() {
        let dir = TempDir::new().unwrap();
        let store = Store::open_at(dir.path().join("bare.db"), 1).unwrap();
        let app = App::new(store, SchemaCheck::Request);

        for url in [
            "/api/v1/connections/filters",
            "/api/v1/connections",
            "/api/v1/connections/stats",
            "/api/v1/connections/stats/advanced",
        ] {
            let (status, body) = get(&app, url);
            assert_eq!(status, 500, "{}", url);
            assert_eq!(body["error"], true);
            assert!(body["message"].as_str().unwrap().contains("'connections' does not exist"));
        }
    }

    #[test]
    fn test_unknown_path_is_404() {
        let (_dir, app) = scenario_app();
        let (status, body) = get(&app, "/api/v2/nothing");
        assert_eq!(status, 404);
        assert_eq!(body["error"], true);
    }

    #[test]
    fn test_post_is_405() {
        let (_dir, app) = scenario_app();
        let reply = route(&app, &Method::Post, "/api/v1/connections");
        assert_eq!(reply.status, 405);
    }

    // ==========================================================================
    // PRE-FLIGHT AND UI TESTS
    // ==========================================================================

    #[test]
    fn test_options_is_empty_success() {
        let (_dir, app) = scenario_app();
        let reply = route(&app, &Method::Options, "/api/v1/connections/stats");
        assert_eq!(reply.status, 200);
        assert!(reply.body.is_empty());
        assert_eq!(reply.content_type, None);
    }

    fn assert_cors(reply: &Reply) {
        let headers = reply.headers();
        for (name, value) in [
            ("Access-Control-Allow-Origin", "*"),
            ("Access-Control-Allow-Methods", "GET, OPTIONS"),
            ("Access-Control-Allow-Headers", "Content-Type"),
        ] {
            assert!(headers.contains(&(name, value)), "missing {} on {}", name, reply.status);
        }
    }

    #[test]
    fn test_every_reply_carries_cors_headers() {
        let (_dir, app) = scenario_app();
        let options = route(&app, &Method::Options, "/api/v1/connections/stats");
        assert_cors(&options);
        assert!(!options.headers().iter().any(|(name, _)| *name == "Content-Type"));

        let ok = route(&app, &Method::Get, "/api/v1/connections");
        assert_cors(&ok);
        assert!(ok.headers().contains(&("Content-Type", "application/json")));

        for reply in [
            route(&app, &Method::Get, "/api/v1/connections?ports=http"),
            route(&app, &Method::Get, "/api/v2/nothing"),
            route(&app, &Method::Post, "/api/v1/connections"),
        ] {
            assert!(reply.status >= 400);
            assert_cors(&reply);
        }
    }

    #[test]
    fn test_root_serves_dashboard() {
        let (_dir, app) = scenario_app();
        let reply = route(&app, &Method::Get, "/");
        assert_eq!(reply.status, 200);
        assert!(reply.content_type.unwrap().starts_with("text/html"));
        assert!(reply.body.contains("'/api/v1/connections'"));
    }
}
