//! Helpers for testing the cache against a real HTTP backend.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`BackendServer`], make sure that the server is held until all requests to
//!    it have been made. The server stops serving when dropped, and requests to it will fail
//!    to connect.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{self, Request};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use reqwest::{StatusCode, Url};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// How long the backend takes to answer requests for the user `slow`.
pub const SLOW_RESPONSE: Duration = Duration::from_millis(200);

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `memocache` crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("memocache=trace,memocache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A fake resource backend that counts the requests it receives.
///
/// It answers `GET /{kind}/{user}` depending on the user:
///
///  - `missing`: `404 Not Found`
///  - anything starting with `fail`: `500 Internal Server Error`
///  - `garbage`: `200 OK` with a body that is not JSON
///  - `slow`: a JSON resource, after waiting for [`SLOW_RESPONSE`]
///  - anything else: a JSON resource right away
///
/// JSON resources look like `{"kind": "insights", "user": "u1"}`.
pub struct BackendServer {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl BackendServer {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri), req: Request, next: Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.path().to_owned()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route("/:kind/:user", get(resource))
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// The number of requests for `path` so far.
    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    /// Returns the total number of requests and resets the counters.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns the requests per path and resets the counters.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for BackendServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn resource(extract::Path((kind, user)): extract::Path<(String, String)>) -> Response {
    match user.as_str() {
        "missing" => StatusCode::NOT_FOUND.into_response(),
        "garbage" => "this is not json".into_response(),
        user if user.starts_with("fail") => {
            (StatusCode::INTERNAL_SERVER_ERROR, "backend exploded").into_response()
        }
        user => {
            if user == "slow" {
                tokio::time::sleep(SLOW_RESPONSE).await;
            }
            Json(serde_json::json!({ "kind": kind, "user": user })).into_response()
        }
    }
}
