//! Wires the offline-first services together.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::binding::{SyncTransport, WsSyncTransport};
use crate::config::AppConfig;
use crate::core::db::QueueDb;
use crate::core::{
    ActiveEntityRegistry, LifecycleHandle, LifecycleSettings, ProjectDirectory, StoreCache,
    StoreLifecycleController,
};
use crate::queue::{
    ReceiptReplicationJob, ScheduleHandle, ScheduledDrain, ServerDeleteJob, UploadRecoveryJob,
};
use crate::remote::{
    AccountingClient, ConnectivityMonitor, DisabledAccounting, HttpMediaClient, MediaClient,
};

const PROBE_INTERVAL: Duration = Duration::from_secs(30);

pub type UploadDrain = ScheduledDrain<UploadRecoveryJob<QueueDb>>;
pub type ReceiptDrain = ScheduledDrain<ReceiptReplicationJob<QueueDb>>;
pub type ServerDeleteDrain = ScheduledDrain<ServerDeleteJob<QueueDb>>;

pub struct App {
    pub config: AppConfig,
    pub registry: Arc<ActiveEntityRegistry>,
    pub directory: Arc<ProjectDirectory>,
    pub cache: Arc<StoreCache>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub queues: QueueDb,
    pub media: Arc<dyn MediaClient>,
    pub controller: StoreLifecycleController,
    authenticated: watch::Sender<bool>,
}

impl App {
    /// Open the queue database and build every service around the given
    /// remote collaborators.
    pub async fn open(
        config: AppConfig,
        transport: Arc<dyn SyncTransport>,
        media: Arc<dyn MediaClient>,
        accounting: Arc<dyn AccountingClient>,
    ) -> anyhow::Result<Self> {
        let queues = QueueDb::open(config.queue_db_path()).await?;
        let registry = Arc::new(ActiveEntityRegistry::new());
        let directory = Arc::new(ProjectDirectory::new());
        let cache = Arc::new(StoreCache::new());
        let controller = StoreLifecycleController::new(
            LifecycleSettings::from_config(&config),
            registry.clone(),
            directory.clone(),
            cache.clone(),
            transport,
            accounting,
        );
        let (authenticated, _) = watch::channel(config.remote.auth_token.is_some());
        Ok(Self {
            config,
            registry,
            directory,
            cache,
            connectivity: Arc::new(ConnectivityMonitor::new(true)),
            queues,
            media,
            controller,
            authenticated,
        })
    }

    /// Production collaborators: WebSocket sync, HTTP media, and no
    /// accounting integration.
    pub async fn connect(config: AppConfig) -> anyhow::Result<Self> {
        let transport: Arc<dyn SyncTransport> = Arc::new(WsSyncTransport::new(&config.remote)?);
        let media: Arc<dyn MediaClient> = Arc::new(HttpMediaClient::new(&config.remote)?);
        Self::open(config, transport, media, Arc::new(DisabledAccounting)).await
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.send_replace(authenticated);
    }

    pub fn upload_drain(&self) -> Arc<UploadDrain> {
        ScheduledDrain::new(
            Arc::new(UploadRecoveryJob::new(
                self.queues.clone(),
                self.media.clone(),
                self.cache.clone(),
            )),
            self.connectivity.clone(),
            self.config.queues.drain_interval(),
        )
    }

    pub fn receipt_drain(&self) -> Arc<ReceiptDrain> {
        ScheduledDrain::new(
            Arc::new(ReceiptReplicationJob::new(
                self.queues.clone(),
                self.cache.clone(),
                self.registry.clone(),
                self.authenticated.subscribe(),
            )),
            self.connectivity.clone(),
            self.config.queues.drain_interval(),
        )
    }

    pub fn server_delete_drain(&self) -> Arc<ServerDeleteDrain> {
        ScheduledDrain::new(
            Arc::new(ServerDeleteJob::new(self.queues.clone(), self.media.clone())),
            self.connectivity.clone(),
            self.config.queues.drain_interval(),
        )
    }

    /// Start the lifecycle watcher and the three queue schedules.
    pub fn start(&self) -> Running {
        let probe = self.connectivity.spawn_http_probe(
            self.config.remote.api_base_url.clone(),
            PROBE_INTERVAL,
            self.config.remote.request_timeout(),
        );
        let lifecycle = self.controller.start();
        let schedules = vec![
            self.upload_drain().start(),
            self.receipt_drain().start(),
            self.server_delete_drain().start(),
        ];
        info!(data_dir = ?self.config.data_dir, "sitebook services started");
        Running {
            lifecycle,
            schedules,
            probe,
        }
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.queues.close().await
    }
}

pub struct Running {
    lifecycle: LifecycleHandle,
    schedules: Vec<ScheduleHandle>,
    probe: JoinHandle<()>,
}

impl Running {
    /// Stop scheduling, then detach every mounted store.
    pub async fn stop(self) {
        self.probe.abort();
        for schedule in self.schedules {
            schedule.stop().await;
        }
        self.lifecycle.stop().await;
        info!("sitebook services stopped");
    }
}
