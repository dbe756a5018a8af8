use std::collections::HashMap;
use std::sync::RwLock;

/// Latest known state for one sport.
///
/// `inited` flips to true on the first score that arrives after the entry
/// was seeded, and never flips back.
#[derive(Debug, Clone, Copy, Default)]
struct CacheEntry {
    inited: bool,
    last_recv: f64,
    last_sent: f64,
}

/// In-memory last-received / last-emitted map per sport.
///
/// Decouples high-frequency poll writes from emission reads: a delta read
/// returns the change since the previous delta read and consumes it, an
/// absolute read leaves the baseline untouched.
#[derive(Default)]
pub struct DeltaCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl DeltaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a received score. The first call for an unknown sport seeds
    /// the entry without marking it initialized; every later call marks it.
    pub fn update(&self, sport: &str, score: f64) {
        let mut entries = self.entries.write().unwrap();
        match entries.get_mut(sport) {
            Some(entry) => {
                entry.inited = true;
                entry.last_recv = score;
            }
            None => {
                entries.insert(
                    sport.to_string(),
                    CacheEntry {
                        inited: false,
                        last_recv: score,
                        last_sent: 0.0,
                    },
                );
            }
        }
    }

    /// Ready iff at least one sport is tracked and every tracked sport has
    /// received a score since being seeded.
    pub fn ready(&self) -> bool {
        let entries = self.entries.read().unwrap();
        !entries.is_empty() && entries.values().all(|e| e.inited)
    }

    /// Delta or absolute read for each requested sport present in the cache.
    ///
    /// `changed == false`: return `last_recv - last_sent` and move the
    /// baseline forward (the delta is consumed). `changed == true`: return
    /// `last_recv` without touching the baseline. Unknown sports are
    /// silently omitted.
    pub fn fetch_delta(&self, sports: &[String], changed: bool) -> HashMap<String, f64> {
        let mut deltas = HashMap::new();
        let mut entries = self.entries.write().unwrap();
        for sport in sports {
            if let Some(entry) = entries.get_mut(sport) {
                if changed {
                    deltas.insert(sport.clone(), entry.last_recv);
                } else {
                    deltas.insert(sport.clone(), entry.last_recv - entry.last_sent);
                    entry.last_sent = entry.last_recv;
                }
            }
        }
        deltas
    }

    #[cfg(test)]
    fn entry(&self, sport: &str) -> Option<CacheEntry> {
        self.entries.read().unwrap().get(sport).copied()
    }
}
