//! HTTP dispatcher: routing, static UI serving and the artifact route.
//!
//! The router owns nothing itself; all shared state (registry, cache,
//! default config, navigation mode) sits in [`ServerState`] behind an `Arc`
//! shared with the lifecycle handle. Routes:
//! - `GET /files/{name}.json.gz` resolves the logical name and serves the
//!   (possibly freshly converted) artifact;
//! - `POST`/`GET /ide/*location` source navigation, mounted only for the
//!   callbacks that were configured;
//! - `GET /show/{name}` redirects into the profiler UI's load-from-URL deep
//!   link;
//! - everything else falls through to the static UI bundle with a
//!   single-page-app fallback to `index.html`.

use std::path::{Path as FsPath, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, RwLock};

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, MethodRouter};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::cache::ArtifactCache;
use crate::config::ConverterConfig;
use crate::navigation::{self, NavigationMode};
use crate::registry::{FileKind, FileRegistry, RegisteredFile, ARTIFACT_SUFFIX};

/// Where failed artifact lookups are sent instead of a structured error body.
const ERROR_PAGE: &str = "/error.html";

pub(crate) struct ServerState {
    /// Written once by the server thread after binding, read everywhere URLs
    /// are built.
    pub(crate) port: AtomicU16,
    pub(crate) registry: FileRegistry,
    pub(crate) cache: ArtifactCache,
    pub(crate) default_config: RwLock<ConverterConfig>,
    pub(crate) navigation: NavigationMode,
    pub(crate) ui_dir: PathBuf,
    pub(crate) verbose: bool,
}

impl ServerState {
    pub(crate) fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    /// The config a conversion of `record` runs with: its override if it has
    /// one, the shared default otherwise, with the advertised source URLs
    /// recomputed for the active navigation mode.
    pub(crate) fn effective_config(&self, record: &RegisteredFile) -> ConverterConfig {
        let mut config = record
            .config_override
            .clone()
            .unwrap_or_else(|| self.default_config.read().unwrap().clone());
        let ide_url = format!("http://localhost:{}/ide", self.port());
        config.source_open_url = self
            .navigation
            .navigate()
            .is_some()
            .then(|| ide_url.clone());
        config.source_fetch_url = self.navigation.fetch_source().is_some().then(|| ide_url);
        config
    }
}

pub(crate) fn artifact_url(port: u16, name: &str) -> String {
    format!(
        "http://localhost:{}/files/{}.json.gz",
        port,
        urlencoding::encode(name)
    )
}

/// The UI's load-from-URL convention: the artifact URL is URL-encoded into a
/// path segment of the UI's own `/from-url/` route.
pub(crate) fn viewer_url(port: u16, name: &str) -> String {
    format!(
        "http://localhost:{}/from-url/{}",
        port,
        urlencoding::encode(&artifact_url(port, name))
    )
}

/// Bind the chosen port, falling back once to an OS-assigned ephemeral port
/// when it is already taken. A second failure aborts startup.
pub(crate) async fn bind_listener(port: u16) -> std::io::Result<TcpListener> {
    match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            warn!(port, "port already taken, retrying on an ephemeral port");
            TcpListener::bind(("127.0.0.1", 0)).await
        }
        Err(err) => Err(err),
    }
}

pub(crate) fn router(state: Arc<ServerState>) -> Router {
    let mut router = Router::new()
        .route("/files/:artifact", get(artifact_handler))
        .route("/show/:name", get(show_handler));

    let ide = ide_routes(&state);
    if let Some(ide) = ide {
        router = router.route("/ide/*location", ide);
    }

    router
        .route("/", get(index_handler))
        .route("/*path", get(static_handler))
        .layer(middleware::from_fn(allow_any_origin))
        .with_state(state)
}

/// Navigation routes for the active mode(s); `None` when navigation is
/// disabled, so the UI sees plain 404s there.
fn ide_routes(state: &Arc<ServerState>) -> Option<MethodRouter<Arc<ServerState>>> {
    if state.navigation.is_disabled() {
        return None;
    }
    let mut routes = MethodRouter::new();
    if let Some(navigate) = state.navigation.navigate().cloned() {
        let verbose = state.verbose;
        routes = routes.post(move |Path(location): Path<String>, body: String| {
            let navigate = navigate.clone();
            async move {
                let body: serde_json::Value =
                    serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
                let destination = navigation::parse_destination(&location, &body);
                if verbose {
                    info!(destination = %destination, "navigating to source");
                }
                navigate(destination);
                "ok"
            }
        });
    }
    if let Some(fetch_source) = state.navigation.fetch_source().cloned() {
        let verbose = state.verbose;
        routes = routes.get(move |Path(location): Path<String>| {
            let fetch_source = fetch_source.clone();
            async move {
                let location = navigation::split_location(&location);
                if verbose {
                    info!(class = %location.class, "fetching source");
                }
                fetch_source(&location)
            }
        });
    }
    Some(routes)
}

async fn artifact_handler(
    State(state): State<Arc<ServerState>>,
    Path(artifact): Path<String>,
) -> Response {
    let Some(name) = artifact.strip_suffix(ARTIFACT_SUFFIX) else {
        return error_redirect();
    };
    let Some(record) = state.registry.resolve(name) else {
        return error_redirect();
    };
    if tokio::fs::metadata(&record.path).await.is_err() {
        return error_redirect();
    }

    match record.kind {
        FileKind::PreConverted => match tokio::fs::read(&record.path).await {
            Ok(bytes) => artifact_response(bytes),
            Err(err) => {
                error!(path = %record.path.display(), "failed to read artifact: {}", err);
                error_redirect()
            }
        },
        FileKind::Recording => {
            let config = state.effective_config(&record);
            if state.verbose {
                info!(source = %record.path.display(), "processing recording");
            }
            let guard = match state.cache.get(&record.path, &config).await {
                Ok(guard) => guard,
                Err(err) => {
                    error!("{}", err);
                    return conversion_failed();
                }
            };
            match guard.read().await {
                Ok(bytes) => artifact_response(bytes),
                Err(err) => {
                    error!(path = %guard.path().display(), "failed to read cached artifact: {}", err);
                    conversion_failed()
                }
            }
        }
    }
}

async fn show_handler(State(state): State<Arc<ServerState>>, Path(name): Path<String>) -> Redirect {
    let target = viewer_url(state.port(), &name);
    info!(target = %target, "redirecting to profiler deep link");
    Redirect::to(&target)
}

async fn index_handler(State(state): State<Arc<ServerState>>) -> Response {
    serve_ui_entry(&state.ui_dir).await
}

async fn static_handler(
    State(state): State<Arc<ServerState>>,
    Path(path): Path<String>,
) -> Response {
    let rel = path.trim_start_matches('/');
    // the bundle is served as-is; never step outside it
    if rel.split('/').any(|component| component == "..") {
        return StatusCode::NOT_FOUND.into_response();
    }
    let full = state.ui_dir.join(rel);
    match tokio::fs::read(&full).await {
        Ok(bytes) => file_response(content_type_for(&full), bytes),
        // SPA fallback: unmatched paths load the entry document
        Err(_) => serve_ui_entry(&state.ui_dir).await,
    }
}

async fn serve_ui_entry(ui_dir: &FsPath) -> Response {
    let index = ui_dir.join("index.html");
    match tokio::fs::read(&index).await {
        Ok(bytes) => file_response("text/html; charset=utf-8", bytes),
        Err(_) => (
            StatusCode::NOT_FOUND,
            format!("Not found: {}", index.display()),
        )
            .into_response(),
    }
}

async fn allow_any_origin(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

fn artifact_response(bytes: Vec<u8>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_ENCODING, "gzip")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Body::from(bytes))
        .unwrap()
}

fn file_response(content_type: &'static str, bytes: Vec<u8>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(bytes))
        .unwrap()
}

fn error_redirect() -> Response {
    Redirect::to(ERROR_PAGE).into_response()
}

fn conversion_failed() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "profile conversion failed",
    )
        .into_response()
}

fn content_type_for(path: &FsPath) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("js") | Some("mjs") => "application/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("html") => "text/html; charset=utf-8",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        Some("wasm") => "application/wasm",
        Some("map") => "application/json",
        _ => "application/octet-stream",
    }
}
