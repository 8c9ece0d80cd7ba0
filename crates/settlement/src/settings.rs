//! Business settings cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use domain::Settings;
use ledger::SettingsStore;
use tokio::sync::RwLock;

use crate::error::Result;

#[derive(Debug)]
struct Snapshot {
    settings: Arc<Settings>,
    loaded_at: Instant,
    invalidated: bool,
}

impl Snapshot {
    fn loaded(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            loaded_at: Instant::now(),
            invalidated: false,
        }
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        !self.invalidated && self.loaded_at.elapsed() < ttl
    }
}

/// Holds the last loaded [`Settings`] snapshot and reloads it from the
/// ledger at most once per `ttl`.
///
/// A failed reload keeps serving the previous snapshot. Only the very first
/// load can fail the caller.
#[derive(Debug, Clone)]
pub struct SettingsCache<L> {
    ledger: L,
    ttl: Duration,
    snapshot: Arc<RwLock<Option<Snapshot>>>,
}

impl<L: SettingsStore> SettingsCache<L> {
    pub fn new(ledger: L, ttl: Duration) -> Self {
        Self {
            ledger,
            ttl,
            snapshot: Arc::new(RwLock::new(None)),
        }
    }

    /// Returns the current snapshot, reloading it if it is older than the TTL.
    pub async fn get(&self) -> Result<Arc<Settings>> {
        {
            let guard = self.snapshot.read().await;
            if let Some(snapshot) = guard.as_ref() {
                if snapshot.is_fresh(self.ttl) {
                    return Ok(snapshot.settings.clone());
                }
            }
        }

        let mut guard = self.snapshot.write().await;
        // another caller may have reloaded while we waited for the lock
        if let Some(snapshot) = guard.as_ref() {
            if snapshot.is_fresh(self.ttl) {
                return Ok(snapshot.settings.clone());
            }
        }

        match self.load().await {
            Ok(settings) => {
                let settings = Arc::new(settings);
                *guard = Some(Snapshot::loaded(settings.clone()));
                Ok(settings)
            }
            Err(e) => match guard.as_mut() {
                Some(stale) => {
                    tracing::warn!(error = %e, "settings reload failed, keeping previous snapshot");
                    // wait a full interval before trying again
                    *stale = Snapshot::loaded(stale.settings.clone());
                    Ok(stale.settings.clone())
                }
                None => Err(e),
            },
        }
    }

    /// Stores one setting and drops the snapshot so the next read sees it.
    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.ledger.put_setting(key, value).await?;
        self.invalidate().await;
        Ok(())
    }

    /// Forces the next `get` to reload.
    pub async fn invalidate(&self) {
        if let Some(snapshot) = self.snapshot.write().await.as_mut() {
            snapshot.invalidated = true;
        }
    }

    async fn load(&self) -> Result<Settings> {
        let pairs = self.ledger.load_settings().await?;
        let settings = Settings::from_pairs(&pairs)?;
        tracing::debug!(?settings, "settings loaded");
        Ok(settings)
    }
}
