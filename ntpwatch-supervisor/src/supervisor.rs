//! Supervisor lifecycle: start the reconciliation loop, drain everything on stop.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, ConfigSource, SupervisorConf};
use crate::identity::{Resolver, ServerIdentity};
use crate::reconcile::{spawn_reconcile_loop, Reconciler};
use crate::sink::{Clock, OutputSink, SystemClock};
use crate::state::{new_state, SamplerInfo, Shared, SupervisedSet};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// State shared by the reconciler and every sampler task of one run.
pub struct SupervisorContext {
    pub sink: OutputSink,
    pub supervised: Shared<SupervisedSet>,
    pub live_children: AtomicUsize,
    pub shutdown: watch::Receiver<bool>,
    pub settings: SupervisorConf,
    pub poll_interval: Duration,
}

impl SupervisorContext {
    pub fn new(sink: OutputSink, settings: SupervisorConf, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            sink,
            supervised: new_state(SupervisedSet::new()),
            live_children: AtomicUsize::new(0),
            shutdown,
            poll_interval: settings.poll_interval(),
            settings,
        }
    }

    pub fn live_children(&self) -> usize {
        self.live_children.load(Ordering::Relaxed)
    }
}

/// Result of [`Supervisor::stop`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Sampler tasks that ended on their own after the shutdown signal.
    pub stopped: usize,
    /// Sampler tasks aborted when the drain timeout elapsed.
    pub aborted: usize,
}

pub struct Supervisor {
    ctx: Arc<SupervisorContext>,
    run_id: String,
    shutdown_tx: watch::Sender<bool>,
    fatal_rx: watch::Receiver<Option<String>>,
    reconcile_task: JoinHandle<()>,
}

impl Supervisor {
    /// Reads the initial configuration and starts the reconciliation loop.
    ///
    /// Fails without starting anything when the configuration is missing or
    /// has no output base path.
    pub async fn start(config: Arc<dyn ConfigSource>, resolver: Arc<dyn Resolver>) -> Result<Self, SupervisorError> {
        Self::start_with_clock(config, resolver, Arc::new(SystemClock)).await
    }

    pub async fn start_with_clock(
        config: Arc<dyn ConfigSource>,
        resolver: Arc<dyn Resolver>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SupervisorError> {
        let initial = config.load().inspect_err(|e| error!("Missing configuration: {e}"))?;
        let base_path = initial.base_path()?.to_path_buf();
        let settings = initial.supervisor.clone();
        settings.validate()?;

        tokio::fs::create_dir_all(&base_path).await?;

        let run_id = Uuid::new_v4().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (fatal_tx, fatal_rx) = watch::channel(None);

        let sink = OutputSink::with_clock(&base_path, run_id.clone(), clock);
        let ctx = Arc::new(SupervisorContext::new(sink, settings, shutdown_rx));

        info!("ntpwatch run {run_id} writing under {}", base_path.display());
        let reconciler = Reconciler::new(ctx.clone(), config, resolver);
        let reconcile_task = spawn_reconcile_loop(reconciler, ctx.settings.refresh_interval(), fatal_tx);

        Ok(Self { ctx, run_id, shutdown_tx, fatal_rx, reconcile_task })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn live_children(&self) -> usize {
        self.ctx.live_children()
    }

    pub fn current_output(&self) -> Option<PathBuf> {
        self.ctx.sink.current_path()
    }

    pub fn supervised(&self) -> Vec<ServerIdentity> {
        let mut identities: Vec<_> = self.ctx.supervised.lock().identities().cloned().collect();
        identities.sort();
        identities
    }

    pub fn status(&self) -> Vec<SamplerInfo> {
        self.ctx.supervised.lock().snapshot()
    }

    /// Resolves with the reason once reconciliation hit a fatal configuration error.
    pub async fn fatal(&self) -> String {
        let mut fatal = self.fatal_rx.clone();
        loop {
            if let Some(reason) = fatal.borrow_and_update().clone() {
                return reason;
            }
            if fatal.changed().await.is_err() {
                // Loop ended without a fatal error; nothing more will arrive.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Stops reconciliation, signals every sampler and waits for them to drain.
    pub async fn stop(self) -> DrainReport {
        self.reconcile_task.abort();
        let _ = self.reconcile_task.await;

        let _ = self.shutdown_tx.send(true);
        let tasks = self.ctx.supervised.lock().drain();
        info!("Stopping {} sampler task(s)", tasks.len());

        let report = match self.ctx.settings.drain_timeout() {
            None => drain(tasks).await,
            Some(limit) => drain_within(tasks, limit).await,
        };

        if let Err(e) = self.ctx.sink.close() {
            error!("failed to close output: {e}");
        }
        info!(
            "Shutdown complete: {} stopped, {} aborted, {} live children left",
            report.stopped,
            report.aborted,
            self.ctx.live_children()
        );
        report
    }
}

async fn drain(tasks: Vec<JoinHandle<()>>) -> DrainReport {
    let mut report = DrainReport::default();
    for task in tasks {
        if let Err(e) = task.await {
            warn!("sampler task ended abnormally: {e}");
        }
        report.stopped += 1;
    }
    report
}

async fn drain_within(tasks: Vec<JoinHandle<()>>, limit: Duration) -> DrainReport {
    let deadline = tokio::time::Instant::now() + limit;
    let mut report = DrainReport::default();
    for mut task in tasks {
        match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(_) => report.stopped += 1,
            Err(_) => {
                // Dropping the aborted task kills its child and releases its live count.
                task.abort();
                let _ = task.await;
                report.aborted += 1;
            }
        }
    }
    report
}
