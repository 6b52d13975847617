use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
    time::Duration,
};

use anyhow::Context as _;
use herald_common::{Signal, audit, audit::AuditConfig, internal, logging};
use herald_delivery::{
    DrainLock, MailNoticeDispatcher, MailWorker, Mailer, MailerConfig, NoticeWorker, Notifier,
    PollLoop, QueueKind, StaticDirectory, TransportConfig,
};
use herald_metrics::MetricsConfig;
use herald_store::{BackingStore, MessageQueue, NoticeQueue, Priority, StoreConfig, UserId};
use serde::Deserialize;
use tokio::{sync::broadcast, task::JoinSet};

/// Mail queue settings
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MailSettings {
    /// Idle interval of the mail poll loop
    pub empty_queue_sleep_secs: u64,
    pub transport: TransportConfig,
    pub default_from: String,
    pub admins: Vec<String>,
    pub managers: Vec<String>,
    pub subject_prefix: String,
}

impl Default for MailSettings {
    fn default() -> Self {
        Self {
            empty_queue_sleep_secs: 30,
            transport: TransportConfig::default(),
            default_from: "herald@localhost".to_string(),
            admins: Vec::new(),
            managers: Vec::new(),
            subject_prefix: "[herald] ".to_string(),
        }
    }
}

/// Notice queue settings
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NoticeSettings {
    /// Run the notice poll loop alongside the mail one
    pub enabled: bool,
    pub poll_interval_secs: u64,
    /// Queue every notice instead of dispatching it on the spot
    pub queue_all: bool,
    pub from_address: String,
    /// Tier of the mail items notices turn into
    pub priority: Priority,
    /// User id to email address
    pub recipients: BTreeMap<u64, String>,
}

impl Default for NoticeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 60,
            queue_all: false,
            from_address: "notices@localhost".to_string(),
            priority: Priority::Medium,
            recipients: BTreeMap::new(),
        }
    }
}

fn default_lock_dir() -> PathBuf {
    std::env::temp_dir().join("herald")
}

/// Top-level configuration and runtime for the herald daemon
///
/// ```ron
/// Herald (
///     store: File(path: "/var/spool/herald"),
///     lock_dir: "/run/herald",
///     mail: (
///         transport: Sendmail(command: "/usr/sbin/sendmail", args: ["-t", "-i"]),
///         default_from: "noreply@example.com",
///     ),
///     notices: (recipients: {7: "someone@example.com"}),
/// )
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Herald {
    pub store: StoreConfig,
    pub lock_dir: PathBuf,
    /// How long a worker waits for a contended drain lock; 0 never waits
    pub lock_wait_timeout_secs: u64,
    pub mail: MailSettings,
    pub notices: NoticeSettings,
    pub audit: AuditConfig,
    pub metrics: MetricsConfig,
}

impl Default for Herald {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            lock_dir: default_lock_dir(),
            lock_wait_timeout_secs: 0,
            mail: MailSettings::default(),
            notices: NoticeSettings::default(),
            audit: AuditConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

/// Find the configuration file using the following precedence:
/// 1. `HERALD_CONFIG` environment variable
/// 2. ./herald.config.ron (current working directory)
/// 3. /etc/herald/herald.config.ron (system-wide config)
///
/// # Errors
/// Fails when `HERALD_CONFIG` names a missing file or no candidate exists.
pub fn find_config_file() -> anyhow::Result<PathBuf> {
    if let Ok(env_path) = std::env::var("HERALD_CONFIG") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!(
            "HERALD_CONFIG points to non-existent file: {}",
            path.display()
        );
    }

    let default_paths = [
        PathBuf::from("./herald.config.ron"),
        PathBuf::from("/etc/herald/herald.config.ron"),
    ];

    for path in &default_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - HERALD_CONFIG environment variable\n{paths_tried}"
    )
}

#[tracing::instrument(level = "trace")]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered, finishing the current cycles");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    Ok(())
}

impl Herald {
    /// Parse a RON document
    ///
    /// # Errors
    /// Returns an error if the document is not a valid configuration.
    pub fn from_ron(content: &str) -> anyhow::Result<Self> {
        ron::from_str(content).context("Invalid herald configuration")
    }

    /// Read and parse the configuration at `path`
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::from_ron(&content)
    }

    /// Open the configured store, creating its layout if needed
    ///
    /// # Errors
    /// Returns an error if the store path is invalid or cannot be prepared.
    pub fn open_store(&self) -> anyhow::Result<Arc<dyn BackingStore>> {
        self.store.open().context("Failed to open the work item store")
    }

    fn lock(&self, queue: QueueKind) -> DrainLock {
        DrainLock::new(&self.lock_dir, queue.lock_name())
    }

    const fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_timeout_secs)
    }

    pub fn mail_worker(&self, store: Arc<dyn BackingStore>) -> MailWorker {
        MailWorker::new(store, self.mail.transport.build(), self.lock(QueueKind::Mail))
            .with_lock_wait(self.lock_wait())
    }

    fn dispatcher(&self, store: Arc<dyn BackingStore>) -> Arc<MailNoticeDispatcher> {
        let directory = StaticDirectory::new(
            self.notices
                .recipients
                .iter()
                .map(|(user, address)| (UserId(*user), address.clone())),
        );

        Arc::new(
            MailNoticeDispatcher::new(
                Arc::new(directory),
                MessageQueue::new(store),
                self.notices.from_address.clone(),
            )
            .with_priority(self.notices.priority),
        )
    }

    pub fn notice_worker(&self, store: Arc<dyn BackingStore>) -> NoticeWorker {
        NoticeWorker::new(
            store.clone(),
            self.dispatcher(store),
            self.lock(QueueKind::Notices),
        )
        .with_lock_wait(self.lock_wait())
    }

    pub fn mailer(&self, store: Arc<dyn BackingStore>) -> Mailer {
        Mailer::new(
            MessageQueue::new(store),
            MailerConfig {
                default_from: self.mail.default_from.clone(),
                admins: self.mail.admins.clone(),
                managers: self.mail.managers.clone(),
                subject_prefix: self.mail.subject_prefix.clone(),
            },
        )
    }

    pub fn notifier(&self, store: Arc<dyn BackingStore>) -> Notifier {
        Notifier::new(NoticeQueue::new(store.clone()), self.dispatcher(store))
            .with_queue_all(self.notices.queue_all)
    }

    /// Start a poll loop per enabled queue, each listening on `signals`
    pub fn spawn(
        &self,
        store: &Arc<dyn BackingStore>,
        signals: &broadcast::Sender<Signal>,
    ) -> JoinSet<()> {
        let mut tasks = JoinSet::new();

        let mail = PollLoop::new(
            self.mail_worker(store.clone()),
            Duration::from_secs(self.mail.empty_queue_sleep_secs),
        );
        tasks.spawn(mail.serve(signals.subscribe()));

        if self.notices.enabled {
            let notices = PollLoop::new(
                self.notice_worker(store.clone()),
                Duration::from_secs(self.notices.poll_interval_secs),
            );
            tasks.spawn(notices.serve(signals.subscribe()));
        }

        tasks
    }

    /// Wait for every poll loop to finish its current cycle and stop
    pub async fn drain_tasks(mut tasks: JoinSet<()>) {
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Poll loop task failed: {e}");
            }
        }
    }

    /// Run the daemon until SIGINT or SIGTERM
    ///
    /// # Errors
    /// Returns an error if metrics or the store cannot be initialised, or if
    /// signal handlers cannot be installed.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();
        audit::init(self.audit.clone());
        herald_metrics::init_metrics(&self.metrics)?;

        let store = self.open_store()?;

        internal!(level = INFO, "Controller running");

        let tasks = self.spawn(&store, &SHUTDOWN_BROADCAST);
        let ret = shutdown().await;

        if let Err(e) = SHUTDOWN_BROADCAST.send(Signal::Shutdown) {
            tracing::debug!("No poll loop left to notify: {e}");
        }
        Self::drain_tasks(tasks).await;
        let _ = SHUTDOWN_BROADCAST.send(Signal::Finalised);

        internal!(level = INFO, "Shutting down...");

        ret
    }
}
