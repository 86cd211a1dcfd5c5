/**
 * RECONCILIATION LOOP - Converges the supervised set onto the configured servers
 *
 * ROLE: once at startup then on a fixed period, reload the server list,
 * resolve it into identities, and start/stop the minimal set of samplers.
 * An identity present both before and after a reload is left untouched.
 *
 * A missing configuration is fatal: the loop raises the supervisor's fatal
 * signal and ends instead of retrying.
 */

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, ConfigSource};
use crate::identity::{self, Resolution, Resolver, ServerIdentity};
use crate::sampler::{SamplerProcess, SamplingSpec};
use crate::state::{new_state, SamplerHandle, SamplerStatus};
use crate::supervisor::SupervisorContext;

/// What one reconciliation pass changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub added: Vec<ServerIdentity>,
    pub removed: Vec<ServerIdentity>,
    /// Names or addresses left out because resolution failed.
    pub skipped: usize,
    /// Size of the supervised set after the pass.
    pub supervised: usize,
}

pub struct Reconciler {
    ctx: Arc<SupervisorContext>,
    config: Arc<dyn ConfigSource>,
    resolver: Arc<dyn Resolver>,
}

impl Reconciler {
    pub fn new(ctx: Arc<SupervisorContext>, config: Arc<dyn ConfigSource>, resolver: Arc<dyn Resolver>) -> Self {
        Self { ctx, config, resolver }
    }

    async fn resolve(&self, names: Vec<String>) -> Resolution {
        let resolver = self.resolver.clone();
        match task::spawn_blocking(move || identity::resolve(resolver.as_ref(), &names)).await {
            Ok(resolution) => resolution,
            Err(e) => {
                error!("name resolution task failed: {e}");
                Resolution::default()
            }
        }
    }

    /// Runs one pass: load, resolve, diff, apply.
    pub async fn reconcile_once(&self) -> Result<ReconcileOutcome, ConfigError> {
        let entries = self.config.load()?.server_entries()?;
        let intervals: HashMap<String, u64> = entries
            .iter()
            .map(|e| (e.name.clone(), e.interval_ms))
            .collect();
        let names: Vec<String> = entries.into_iter().map(|e| e.name).collect();

        let resolution = self.resolve(names).await;
        let desired: HashSet<ServerIdentity> = resolution.identities.into_iter().collect();

        let settings = &self.ctx.settings;
        let mut outcome = ReconcileOutcome { skipped: resolution.skipped.len(), ..Default::default() };
        let mut supervised = self.ctx.supervised.lock();

        // Shutdown takes this same lock after raising the signal, so no add can slip past it.
        let shutting_down = *self.ctx.shutdown.borrow();

        let removed: Vec<ServerIdentity> = supervised
            .identities()
            .filter(|identity| !desired.contains(*identity))
            .cloned()
            .collect();
        for identity in removed {
            supervised.remove(&identity);
            info!("Stopped monitoring NTP server: {identity}");
            outcome.removed.push(identity);
        }

        if !shutting_down {
            for identity in desired {
                if supervised.contains(&identity) {
                    continue;
                }
                let interval_ms = intervals
                    .get(identity.configured_name())
                    .copied()
                    .unwrap_or(crate::config::DEFAULT_INTERVAL_MS);
                let spec = SamplingSpec::for_identity(
                    &identity,
                    interval_ms,
                    settings.run_duration_secs,
                    &settings.remote_sampler,
                    &settings.local_sampler,
                );

                info!(
                    "Monitoring NTP server: {} IPAddress: {} ({})",
                    identity.configured_name(),
                    identity.address(),
                    identity.resolved_name()
                );
                let handle = self.start_sampler(identity.clone(), spec);
                if let Err(handle) = supervised.insert(identity.clone(), handle) {
                    handle.cancel();
                    continue;
                }
                outcome.added.push(identity);
            }
        }

        if supervised.is_empty() && !shutting_down {
            warn!("No NTP server is being monitored");
        }
        outcome.supervised = supervised.len();
        Ok(outcome)
    }

    fn start_sampler(&self, identity: ServerIdentity, spec: SamplingSpec) -> SamplerHandle {
        let instance_id = Uuid::new_v4();
        let status = new_state(SamplerStatus::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        let process = SamplerProcess::new(identity, spec, instance_id, status.clone(), stop_rx, self.ctx.clone());
        let task = task::spawn(process.run());
        SamplerHandle::new(instance_id, status, stop_tx, task)
    }
}

/// Starts the periodic reconciliation task. The first pass runs immediately.
///
/// On a configuration error the task logs it, sends on `fatal` and ends.
pub fn spawn_reconcile_loop(
    reconciler: Reconciler,
    period: Duration,
    fatal: watch::Sender<Option<String>>,
) -> JoinHandle<()> {
    task::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = reconciler.ctx.shutdown.clone();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            if *shutdown.borrow() {
                return;
            }

            match reconciler.reconcile_once().await {
                Ok(outcome) => debug!(
                    "reconciled: +{} -{} skipped {} supervised {} live children {}",
                    outcome.added.len(),
                    outcome.removed.len(),
                    outcome.skipped,
                    outcome.supervised,
                    reconciler.ctx.live_children(),
                ),
                Err(e) => {
                    error!("Missing configuration: {e}");
                    let _ = fatal.send(Some(e.to_string()));
                    return;
                }
            }
        }
    })
}
