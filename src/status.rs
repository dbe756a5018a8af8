use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::lines::provider::{LinesProvider, ProviderState, ScoreSource};
use crate::rpc::server::RpcServer;

/// Shared state behind the status endpoint.
///
/// Holds the lazily-started streaming server: the first `/ready` request
/// that observes a ready provider brings it up.
pub struct StatusState {
    provider: Arc<LinesProvider>,
    rpc_addr: String,
    rpc: Mutex<Option<RpcServer>>,
}

impl StatusState {
    pub fn new(provider: Arc<LinesProvider>, rpc_addr: String) -> Self {
        StatusState {
            provider,
            rpc_addr,
            rpc: Mutex::new(None),
        }
    }

    /// Stop the streaming server if it was ever started.
    pub async fn stop_rpc(&self) {
        if let Some(server) = self.rpc.lock().await.take() {
            server.stop().await;
        }
    }
}

/// Build the read-only status/query router.
pub fn router(state: Arc<StatusState>) -> Router {
    Router::new()
        .route("/ready", get(ready_handler))
        .route("/lines/:sport", get(history_handler))
        .route("/lines/:sport/last", get(last_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// GET /ready — 200 once every tracked sport has completed a poll, 425
/// before that. Readiness gates the streaming server: it is started on the
/// first ready response.
async fn ready_handler(State(state): State<Arc<StatusState>>) -> impl IntoResponse {
    if state.provider.state() != ProviderState::Ready {
        return StatusCode::TOO_EARLY;
    }

    let mut rpc = state.rpc.lock().await;
    if rpc.is_none() {
        let provider: Arc<dyn ScoreSource> = Arc::clone(&state.provider);
        match RpcServer::start(&state.rpc_addr, provider).await {
            Ok(server) => {
                info!(addr = %server.local_addr(), "streaming server started");
                *rpc = Some(server);
            }
            Err(e) => {
                error!(error = %e, "failed to start streaming server");
                return StatusCode::INTERNAL_SERVER_ERROR;
            }
        }
    }
    StatusCode::OK
}

/// GET /lines/:sport — one page of persisted scores, most-recent-first.
async fn history_handler(
    State(state): State<Arc<StatusState>>,
    Path(sport): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let mut lines = state.provider.fetch(std::slice::from_ref(&sport)).await;
    match lines.remove(&sport) {
        Some(scores) => Ok(Json(json!({"sport": sport, "scores": scores}))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

/// GET /lines/:sport/last — the last persisted score.
async fn last_handler(
    State(state): State<Arc<StatusState>>,
    Path(sport): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let mut lines = state.provider.fetch_last(std::slice::from_ref(&sport)).await;
    match lines.remove(&sport) {
        Some(score) => Ok(Json(json!({"sport": sport, "score": score}))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let dir =
            std::env::temp_dir().join(format!("sportlines-status-{}-{tag}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let _ = std::fs::remove_file(dir.join("lines.db"));
        dir
    }

    /// Provider whose poller never fires during the test (dead upstream,
    /// hour-long period), so readiness is driven by explicit updates.
    async fn provider(tag: &str) -> Arc<LinesProvider> {
        let provider =
            LinesProvider::new(&[], "http://127.0.0.1:9", "api/v1/lines", &temp_dir(tag))
                .await
                .unwrap();
        provider
            .add("baseball", Duration::from_secs(3600))
            .await
            .unwrap();
        provider
    }

    async fn serve(state: Arc<StatusState>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn state_for(provider: &Arc<LinesProvider>) -> Arc<StatusState> {
        Arc::new(StatusState::new(
            Arc::clone(provider),
            "127.0.0.1:0".to_string(),
        ))
    }

    #[tokio::test]
    async fn reports_too_early_until_every_sport_has_polled() {
        let provider = provider("too-early").await;
        let state = state_for(&provider);
        let base = serve(Arc::clone(&state)).await;

        let resp = reqwest::get(format!("{base}/ready")).await.unwrap();
        assert_eq!(resp.status().as_u16(), 425);

        provider.update("baseball", 2.0).await;
        let resp = reqwest::get(format!("{base}/ready")).await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);

        state.stop_rpc().await;
        provider.shutdown().await;
    }

    #[tokio::test]
    async fn readiness_starts_the_streaming_server_once() {
        let provider = provider("starts-rpc").await;
        provider.update("baseball", 2.0).await;

        let state = state_for(&provider);
        let base = serve(Arc::clone(&state)).await;

        assert!(state.rpc.lock().await.is_none());

        let resp = reqwest::get(format!("{base}/ready")).await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let rpc_addr = state.rpc.lock().await.as_ref().map(|s| s.local_addr());
        assert!(rpc_addr.is_some());

        // A second ready request reuses the running server.
        let resp = reqwest::get(format!("{base}/ready")).await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(
            state.rpc.lock().await.as_ref().map(|s| s.local_addr()),
            rpc_addr
        );

        state.stop_rpc().await;
        provider.shutdown().await;
    }

    #[tokio::test]
    async fn query_endpoints_read_through_to_the_store() {
        let provider = provider("query").await;
        provider.update("baseball", 1.5).await;
        provider.update("baseball", 2.5).await;

        let state = state_for(&provider);
        let base = serve(Arc::clone(&state)).await;

        let last: serde_json::Value = reqwest::get(format!("{base}/lines/baseball/last"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(last, json!({"sport": "baseball", "score": 2.5}));

        let history: serde_json::Value = reqwest::get(format!("{base}/lines/baseball"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(history, json!({"sport": "baseball", "scores": [2.5, 1.5]}));

        let resp = reqwest::get(format!("{base}/lines/cricket")).await.unwrap();
        assert_eq!(resp.status().as_u16(), 404);

        provider.shutdown().await;
    }
}
