use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use reqwest::Client;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Invoked with `(sport, score)` after every successful fetch.
pub type PollCallback = Arc<dyn Fn(String, f64) -> BoxFuture<'static, ()> + Send + Sync>;

/// Background task that fetches one sport's score at a fixed period.
///
/// Each tick waits the full period (interruptible by [`stop`]) and then
/// issues a single fetch. A failed tick is logged and skipped; the next
/// tick retries naturally. Failures never escape the task.
///
/// [`stop`]: LinePoller::stop
pub struct LinePoller {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LinePoller {
    pub fn new(
        http: Client,
        address: String,
        sport: String,
        period: Duration,
        callback: PollCallback,
    ) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        debug!(sport, address, ?period, "starting poller");

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                match poll_once(&http, &address, &sport).await {
                    Ok(score) => {
                        debug!(sport, score, "poll tick");
                        callback(sport.clone(), score).await;
                    }
                    Err(e) => warn!(sport, error = %e, "poll failed"),
                }
            }
            debug!(sport, "poller stopped");
        });

        LinePoller { stop, task }
    }

    /// Signal the loop to stop, wake its wait, and join the task.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

/// One fetch: `GET <address>` and read `lines.<SPORT_UPPERCASE>` from the
/// JSON body. A 200 body without the key scores 0.0; transport failures
/// and non-200 responses are errors (no update this tick).
async fn poll_once(http: &Client, address: &str, sport: &str) -> Result<f64> {
    let resp = http
        .get(address)
        .send()
        .await
        .context("upstream request failed")?;
    if !resp.status().is_success() {
        anyhow::bail!("upstream status {}", resp.status());
    }
    let body: serde_json::Value = resp.json().await.context("upstream body is not JSON")?;
    Ok(extract_score(&body, sport))
}

fn extract_score(body: &serde_json::Value, sport: &str) -> f64 {
    body.get("lines")
        .and_then(|lines| lines.get(sport.to_uppercase()))
        .and_then(serde_json::Value::as_f64)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use axum::{routing::get, Json, Router};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn collecting_callback() -> (PollCallback, mpsc::UnboundedReceiver<(String, f64)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: PollCallback = Arc::new(move |sport, score| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send((sport, score));
            })
        });
        (callback, rx)
    }

    async fn serve(router: Router) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    #[test]
    fn extracts_score_by_uppercased_sport() {
        let body = json!({"lines": {"BASEBALL": 7.5, "FOOTBALL": 1.25}});
        assert_relative_eq!(extract_score(&body, "baseball"), 7.5);
        assert_relative_eq!(extract_score(&body, "football"), 1.25);
    }

    #[test]
    fn missing_or_non_numeric_score_defaults_to_zero() {
        assert_relative_eq!(extract_score(&json!({}), "baseball"), 0.0);
        assert_relative_eq!(extract_score(&json!({"lines": {}}), "baseball"), 0.0);
        assert_relative_eq!(
            extract_score(&json!({"lines": {"BASEBALL": "n/a"}}), "baseball"),
            0.0
        );
    }

    #[tokio::test]
    async fn reports_scores_through_the_callback() {
        let addr = serve(Router::new().route(
            "/api/v1/lines/baseball",
            get(|| async { Json(json!({"lines": {"BASEBALL": 7.5}})) }),
        ))
        .await;

        let (callback, mut rx) = collecting_callback();
        let poller = LinePoller::new(
            Client::new(),
            format!("http://{addr}/api/v1/lines/baseball"),
            "baseball".to_string(),
            Duration::from_millis(50),
            callback,
        );

        let (sport, score) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("a tick within the timeout")
            .unwrap();
        assert_eq!(sport, "baseball");
        assert_relative_eq!(score, 7.5);

        poller.stop().await;
    }

    #[tokio::test]
    async fn failed_ticks_are_skipped() {
        let addr = serve(Router::new().route(
            "/api/v1/lines/baseball",
            get(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "down") }),
        ))
        .await;

        let (callback, mut rx) = collecting_callback();
        let poller = LinePoller::new(
            Client::new(),
            format!("http://{addr}/api/v1/lines/baseball"),
            "baseball".to_string(),
            Duration::from_millis(30),
            callback,
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());

        poller.stop().await;
    }
}
