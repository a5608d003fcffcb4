//! Testing helpers.
//!
//! An axum stub server that answers canned responses in order and records
//! every request it received.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// Placeholder in canned bodies replaced by the server's base URL
pub const BASE_URL_PLACEHOLDER: &str = "{base_url}";

struct StubState {
    base_url: String,
    delay: Duration,
    responses: Mutex<VecDeque<(u16, &'static str)>>,
    requests: Mutex<Vec<String>>,
}

/// Handle to a running stub server.
pub struct StubServer {
    /// `http://127.0.0.1:<port>`
    pub base_url: String,
    state: Arc<StubState>,
}

impl StubServer {
    /// Requests received so far, in order, as `"<METHOD> <path>\n<body>"`.
    pub async fn requests(&self) -> Vec<String> {
        self.state.requests.lock().await.clone()
    }

    /// Paths of the requests received so far.
    pub async fn paths(&self) -> Vec<String> {
        self.requests()
            .await
            .iter()
            .filter_map(|r| r.lines().next())
            .filter_map(|line| line.split(' ').nth(1))
            .map(str::to_string)
            .collect()
    }
}

/// Starts a server that replies with `responses` in order.
///
/// Requests past the last canned reply get a 500.
pub async fn stub_server(responses: Vec<(u16, &'static str)>) -> std::io::Result<StubServer> {
    stub_server_with_delay(responses, Duration::ZERO).await
}

/// Like [`stub_server`], but holds every reply back for `delay`.
pub async fn stub_server_with_delay(
    responses: Vec<(u16, &'static str)>,
    delay: Duration,
) -> std::io::Result<StubServer> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let base_url = format!("http://{}", listener.local_addr()?);

    let state = Arc::new(StubState {
        base_url: base_url.clone(),
        delay,
        responses: Mutex::new(responses.into()),
        requests: Mutex::default(),
    });
    let app = Router::new()
        .fallback(reply)
        .with_state(Arc::clone(&state));

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Ok(StubServer { base_url, state })
}

async fn reply(
    State(state): State<Arc<StubState>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    state.requests.lock().await.push(format!(
        "{method} {}\n{}",
        uri.path(),
        String::from_utf8_lossy(&body)
    ));
    let next = state.responses.lock().await.pop_front();
    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }

    let Some((status, body)) = next else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "no canned response left").into_response();
    };
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = body.replace(BASE_URL_PLACEHOLDER, &state.base_url);
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

/// HTTP client for talking to stub servers, bypassing any configured proxy.
pub fn local_client() -> reqwest::Client {
    local_client_with_timeout(Duration::from_secs(5))
}

/// [`local_client`] with a custom request timeout.
pub fn local_client_with_timeout(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Returns a URL on a local port with nothing listening.
pub async fn unused_local_url() -> std::io::Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(format!("http://{addr}/closed"))
}
