use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::error::LinesError;
use crate::lines::cache::DeltaCache;
use crate::lines::poller::{LinePoller, PollCallback};
use crate::store::LineStore;

/// Readiness of the tracked sport set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    /// Every tracked sport has completed at least one poll.
    Ready,
    /// No sports are tracked yet, or some sport has never polled.
    NotInited,
}

/// Contract the streaming server pulls scores through.
#[async_trait]
pub trait ScoreSource: Send + Sync {
    /// Delta (`changed == false`, consuming) or absolute (`changed == true`)
    /// read for the requested sports. Unknown sports are omitted.
    async fn fetch_delta(&self, sports: &[String], changed: bool) -> HashMap<String, f64>;
}

/// Orchestrator for the tracked sport set.
///
/// Owns the pooled store, the delta cache, and one [`LinePoller`] per sport.
/// Poll results flow through [`update`]: persisted first, cached second, so
/// the cache always reflects the newest observation even when a write fails.
///
/// [`update`]: LinesProvider::update
pub struct LinesProvider {
    address: String,
    http: Client,
    store: LineStore,
    cache: DeltaCache,
    pollers: Mutex<HashMap<String, LinePoller>>,
    /// Handed to poller callbacks so they never keep the provider alive.
    weak: Weak<LinesProvider>,
}

impl LinesProvider {
    /// Open the store under `data_dir` and start tracking every configured
    /// `(sport, polling period in seconds)` pair.
    pub async fn new(
        sports: &[(String, u64)],
        host: &str,
        api: &str,
        data_dir: &Path,
    ) -> Result<Arc<Self>, LinesError> {
        let address = format!("{host}/{api}");
        info!(address, "lines provider starting");

        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LinesError::InvalidArgument(format!("http client: {e}")))?;
        let store = LineStore::open(data_dir)?;

        let provider = Arc::new_cyclic(|weak| LinesProvider {
            address,
            http,
            store,
            cache: DeltaCache::new(),
            pollers: Mutex::new(HashMap::new()),
            weak: weak.clone(),
        });

        for (sport, period) in sports {
            provider.add(sport, Duration::from_secs(*period)).await?;
        }

        Ok(provider)
    }

    /// Track a sport: register its line in the store, seed its cache entry,
    /// and start its poller. A sport that already has a poller keeps it.
    pub async fn add(&self, sport: &str, period: Duration) -> Result<(), LinesError> {
        self.store.add_line(sport).await?;
        self.cache.update(sport, 0.0);

        let mut pollers = self.pollers.lock().unwrap();
        if !pollers.contains_key(sport) {
            let address = format!("{}/{}", self.address, sport);
            let weak = self.weak.clone();
            let callback: PollCallback = Arc::new(move |sport, score| {
                let provider = weak.upgrade();
                Box::pin(async move {
                    if let Some(provider) = provider {
                        provider.update(&sport, score).await;
                    }
                })
            });
            pollers.insert(
                sport.to_string(),
                LinePoller::new(self.http.clone(), address, sport.to_string(), period, callback),
            );
        }
        Ok(())
    }

    /// Stop tracking a sport. Its poller is joined and its stored line
    /// dropped; the cache entry stays.
    #[allow(dead_code)]
    pub async fn rem(&self, sport: &str) -> Result<(), LinesError> {
        let poller = self.pollers.lock().unwrap().remove(sport);
        if let Some(poller) = poller {
            poller.stop().await;
        }
        self.store.rem_line(sport).await
    }

    /// Persist and cache one observed score. A store failure is contained
    /// here: the cache still advances and the next tick retries the write.
    pub async fn update(&self, sport: &str, score: f64) {
        if let Err(e) = self.store.update_line(sport, score).await {
            warn!(sport, error = %e, "failed to persist score");
        }
        self.cache.update(sport, score);
        debug!(sport, score, "line updated");
    }

    pub fn state(&self) -> ProviderState {
        if self.cache.ready() {
            ProviderState::Ready
        } else {
            ProviderState::NotInited
        }
    }

    /// Historical scores per sport, most-recent-first, straight from the
    /// store. Sports that fail to read are omitted.
    pub async fn fetch(&self, sports: &[String]) -> HashMap<String, Vec<f64>> {
        let mut lines = HashMap::new();
        for sport in sports {
            match self.store.fetch_score(sport).await {
                Ok(scores) => {
                    lines.insert(sport.clone(), scores);
                }
                Err(e) => warn!(sport, error = %e, "failed to fetch history"),
            }
        }
        lines
    }

    /// Last persisted score per sport, straight from the store.
    pub async fn fetch_last(&self, sports: &[String]) -> HashMap<String, f64> {
        let mut lines = HashMap::new();
        for sport in sports {
            match self.store.last_score(sport).await {
                Ok(score) => {
                    lines.insert(sport.clone(), score);
                }
                Err(e) => warn!(sport, error = %e, "failed to fetch last score"),
            }
        }
        lines
    }

    /// Stop every poller, then drain the store.
    pub async fn shutdown(&self) {
        let pollers: Vec<LinePoller> = {
            let mut map = self.pollers.lock().unwrap();
            map.drain().map(|(_, poller)| poller).collect()
        };
        for poller in pollers {
            poller.stop().await;
        }
        self.store.close().await;
        info!("lines provider stopped");
    }
}

#[async_trait]
impl ScoreSource for LinesProvider {
    async fn fetch_delta(&self, sports: &[String], changed: bool) -> HashMap<String, f64> {
        self.cache.fetch_delta(sports, changed)
    }
}
