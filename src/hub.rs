//! Composition root
//!
//! Opens every persistent table, wires the components together, and spawns
//! the background loops (backup supervisor, reaper). Component handles are
//! passed around explicitly as `Arc`s; there are no process-global
//! singletons.

use crate::auth::TokenStore;
use crate::bus::TopicBus;
use crate::channels::Channels;
use crate::config::HubConfig;
use crate::dispatch::EndpointRegistry;
use crate::error::HubError;
use crate::goals::GoalBacklog;
use crate::mailbox::Mailbox;
use crate::presence::PresenceRegistry;
use crate::rate_limit::{RateLimiter, RateLimits};
use crate::reaper::Reaper;
use crate::repos::RepoRegistry;
use crate::router::MessageRouter;
use crate::settings::Settings;
use crate::storage::{BackupSupervisor, KvTable};
use crate::tasks::TaskQueue;
use crate::threads::ThreadIndex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Settings-store key for persisted rate-limit defaults.
const RATE_LIMITS_KEY: &str = "rate_limits";

/// The assembled hub.
pub struct Hub {
    pub config: HubConfig,
    pub bus: Arc<TopicBus>,
    pub auth: Arc<TokenStore>,
    pub settings: Arc<Settings>,
    pub limiter: Arc<RateLimiter>,
    pub presence: Arc<PresenceRegistry>,
    pub mailbox: Arc<Mailbox>,
    pub channels: Arc<Channels>,
    pub threads: Arc<ThreadIndex>,
    pub router: Arc<MessageRouter>,
    pub goals: Arc<GoalBacklog>,
    pub tasks: Arc<TaskQueue>,
    pub endpoints: Arc<EndpointRegistry>,
    pub repos: Arc<RepoRegistry>,
    pub backup: Arc<BackupSupervisor>,
    tables: Vec<Arc<KvTable>>,
}

impl Hub {
    /// Opens all stores under the configured data directory and assembles
    /// the component graph.
    ///
    /// # Errors
    ///
    /// Returns an error when any store fails to open.
    pub async fn open(config: HubConfig) -> Result<Arc<Self>, HubError> {
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let backup = Arc::new(BackupSupervisor::new(
            config.backup_dir.clone(),
            config.backup_keep,
            config.backup_interval(),
        ));
        let corruption = backup.corruption_sender();

        let mut tables = Vec::new();
        let mut open_table = |name: &'static str| {
            let dir = config.data_dir.clone();
            let tx = corruption.clone();
            async move { KvTable::open(&dir, name, Some(tx)).await }
        };

        let config_table = Arc::new(open_table("config").await?);
        let mailbox_table = Arc::new(open_table("mailbox").await?);
        let channels_table = Arc::new(open_table("channels").await?);
        let threads_table = Arc::new(open_table("threads").await?);
        let goals_table = Arc::new(open_table("goal_backlog").await?);
        let tasks_table = Arc::new(open_table("task_queue").await?);
        let repos_table = Arc::new(open_table("repo_registry").await?);
        for table in [
            &config_table,
            &mailbox_table,
            &channels_table,
            &threads_table,
            &goals_table,
            &tasks_table,
            &repos_table,
        ] {
            backup.register_table(table.clone()).await;
            tables.push(table.clone());
        }

        let bus = Arc::new(TopicBus::new());
        let auth = Arc::new(TokenStore::load(config.data_dir.join("tokens.json")).await?);
        let settings = Arc::new(Settings::new(config_table));
        let stored_limits: Option<RateLimits> = settings.get(RATE_LIMITS_KEY).await?;
        let env_limits = config
            .rate_limits
            .as_deref()
            .and_then(|raw| match serde_json::from_str::<RateLimits>(raw) {
                Ok(limits) => Some(limits),
                Err(err) => {
                    tracing::warn!(%err, "ignoring unparseable rate-limit override");
                    None
                }
            });
        let limits = env_limits.or(stored_limits).unwrap_or_default();
        let limiter = Arc::new(RateLimiter::new(limits));
        let presence = Arc::new(PresenceRegistry::new(bus.clone()));
        let mailbox = Arc::new(Mailbox::open(mailbox_table).await?);
        let channels = Arc::new(Channels::new(channels_table, bus.clone()));
        let threads = Arc::new(ThreadIndex::new(threads_table));
        let router = Arc::new(MessageRouter::new(
            presence.clone(),
            bus.clone(),
            threads.clone(),
        ));
        let goals = Arc::new(GoalBacklog::open(goals_table, bus.clone()).await?);
        let tasks = Arc::new(TaskQueue::new(tasks_table, bus.clone()));
        let endpoints = Arc::new(EndpointRegistry::new());
        let repos = Arc::new(RepoRegistry::new(repos_table));

        info!(data_dir = %config.data_dir.display(), "hub assembled");
        Ok(Arc::new(Self {
            config,
            bus,
            auth,
            settings,
            limiter,
            presence,
            mailbox,
            channels,
            threads,
            router,
            goals,
            tasks,
            endpoints,
            repos,
            backup,
            tables,
        }))
    }

    /// Spawns the background loops. They run until `cancel` fires.
    pub fn start_background(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        handles.push(tokio::spawn(
            self.backup.clone().run(cancel.clone()),
        ));
        let reaper = Reaper::new(self.clone());
        handles.push(tokio::spawn(reaper.run(cancel.clone())));
        handles
    }

    /// Flushes and closes every table. Call after the background loops have
    /// stopped.
    pub async fn shutdown(&self) {
        for table in &self.tables {
            if let Err(err) = table.sync().await {
                tracing::warn!(table = table.name(), %err, "final sync failed");
            }
            table.close().await;
        }
        info!("hub shut down");
    }
}
