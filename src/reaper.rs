//! Reaper
//!
//! Periodic sweep closing the loops the happy path missed: idle sessions,
//! orphaned task assignments, stale endpoints, and (hourly) expired mailbox
//! entries. Sweep errors are logged and never surfaced to users.

use crate::domain_types::now_ms;
use crate::hub::Hub;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAILBOX_EVICTION_EVERY: Duration = Duration::from_secs(3600);

/// Background sweeper.
pub struct Reaper {
    hub: Arc<Hub>,
}

impl Reaper {
    #[must_use]
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }

    /// One full sweep. Public so tests can drive it without timers.
    pub async fn sweep(&self) {
        let now = now_ms();
        let hub = &self.hub;

        // Idle sessions: kill the registration; the session notices on its
        // next push attempt and the socket is closed by its own loop.
        let idle_ms = hub.config.session_idle().as_millis() as u64;
        for agent_id in hub.presence.stale(now, idle_ms) {
            info!(agent_id = %agent_id, "reaping idle session");
            hub.presence.unregister(&agent_id);
        }

        // Orphaned assignments: worker gone or silent past the timeout.
        let orphan_ms = hub.config.orphan_timeout().as_millis() as u64;
        let presence = hub.presence.clone();
        match hub
            .tasks
            .reclaim_stale(move |agent| presence.contains(agent), now, orphan_ms)
            .await
        {
            Ok(reclaimed) if !reclaimed.is_empty() => {
                info!(count = reclaimed.len(), "orphaned tasks reclaimed");
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "task reclamation sweep failed"),
        }

        // Endpoints that stopped reporting.
        let stale_ms = hub.config.endpoint_stale_secs * 1000;
        let flipped = hub.endpoints.mark_stale(now, stale_ms);
        if flipped > 0 {
            debug!(flipped, "stale endpoints marked unreachable");
        }
    }

    async fn evict_mailbox(&self) {
        let ttl_ms = self.hub.config.mailbox_ttl().as_millis() as u64;
        match self.hub.mailbox.evict_expired(now_ms(), ttl_ms).await {
            Ok(evicted) if evicted > 0 => info!(evicted, "mailbox eviction sweep"),
            Ok(_) => {}
            Err(err) => warn!(%err, "mailbox eviction failed"),
        }
    }

    /// Sweep loop. Runs until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.hub.config.reaper_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        let mut eviction_ticker = tokio::time::interval(MAILBOX_EVICTION_EVERY);
        eviction_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        eviction_ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.sweep().await,
                _ = eviction_ticker.tick() => self.evict_mailbox().await,
            }
        }
        info!("reaper stopped");
    }
}
