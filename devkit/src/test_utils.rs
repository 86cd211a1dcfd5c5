/*!
Test Harness pour le superviseur ntpwatch

Facilite l'écriture de tests avec:
- Répertoire temporaire isolé (scripts + fichiers CSV)
- Résolveur statique et configuration en mémoire pré-câblés
- Scripts d'échantillonneur exécutés via `/bin/sh <script>` (pas de bit exécutable requis)
- Attente active bornée sur une condition
*/

use crate::config_stub::MemoryConfigSource;
use crate::resolver_stub::StaticResolver;
use anyhow::Result;
use ntpwatch::config::SupervisorConf;
use ntpwatch::{OutputSink, Reconciler, SamplerCommand, Supervisor, SupervisorContext};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

/// Init logging pour tests (idempotent)
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Attend que `condition` soit vraie, au plus `limit`
pub async fn wait_until<F: FnMut() -> bool>(limit: Duration, mut condition: F) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < limit {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Toutes les lignes de tous les CSV d'un répertoire, fichiers triés par nom
pub fn read_rows(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("csv"))
        .collect();
    files.sort();
    files
        .iter()
        .flat_map(|f| {
            std::fs::read_to_string(f)
                .unwrap_or_default()
                .lines()
                .map(String::from)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Script d'échantillonneur écrit dans le répertoire du test.
///
/// Le superviseur lance `/bin/sh <script> <target> <interval-ms> <duration-s>`,
/// donc `$1`, `$2`, `$3` sont disponibles dans le corps du script.
pub struct SamplerScript {
    pub path: PathBuf,
}

impl SamplerScript {
    pub fn new(dir: &Path, name: &str, body: &str) -> Result<Self> {
        let path = dir.join(format!("{name}.sh"));
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
        Ok(Self { path })
    }

    /// Émet les lignes données puis reste vivant `hold_secs` secondes
    pub fn emit_then_hold(dir: &Path, name: &str, lines: &[&str], hold_secs: u64) -> Result<Self> {
        let mut body: String = lines.iter().map(|l| format!("echo \"{l}\"\n")).collect();
        body.push_str(&format!("exec sleep {hold_secs}"));
        Self::new(dir, name, &body)
    }

    /// Émet les lignes données, note le lancement dans `spawn_log` puis sort
    pub fn emit_then_exit(dir: &Path, name: &str, lines: &[&str], spawn_log: &Path) -> Result<Self> {
        let mut body: String = lines.iter().map(|l| format!("echo \"{l}\"\n")).collect();
        body.push_str(&format!("echo \"$1\" >> \"{}\"\nexit 0", spawn_log.display()));
        Self::new(dir, name, &body)
    }

    /// Note chaque lancement dans `spawn_log` et sort aussitôt sans rien émettre
    pub fn exit_immediately(dir: &Path, name: &str, spawn_log: &Path) -> Result<Self> {
        Self::new(dir, name, &format!("echo \"$1\" >> \"{}\"\nexit 0", spawn_log.display()))
    }

    pub fn command(&self) -> SamplerCommand {
        SamplerCommand::new("/bin/sh").with_args([self.path.display().to_string()])
    }
}

/// Harness de test complet pour le superviseur
pub struct TestHarness {
    pub dir: TempDir,
    pub output_dir: PathBuf,
    pub config: MemoryConfigSource,
    pub resolver: StaticResolver,
}

impl TestHarness {
    pub fn new() -> Result<Self> {
        init_test_logging();
        let dir = tempfile::tempdir()?;
        let output_dir = dir.path().join("out");
        let config = MemoryConfigSource::new(&output_dir);
        config.set_supervisor(Self::fast_settings());
        Ok(Self { dir, output_dir, config, resolver: StaticResolver::new() })
    }

    /// Réglages accélérés pour les tests
    pub fn fast_settings() -> SupervisorConf {
        SupervisorConf {
            refresh_interval_secs: 1,
            poll_interval_ms: 50,
            ..SupervisorConf::default()
        }
    }

    pub fn script(&self, name: &str, body: &str) -> Result<SamplerScript> {
        SamplerScript::new(self.dir.path(), name, body)
    }

    /// Utilise `remote` et `local` comme échantillonneurs
    pub fn use_samplers(&self, remote: &SamplerScript, local: &SamplerScript) {
        let conf = SupervisorConf {
            remote_sampler: remote.command(),
            local_sampler: local.command(),
            ..Self::fast_settings()
        };
        self.config.set_supervisor(conf);
    }

    pub fn rows(&self) -> Vec<String> {
        read_rows(&self.output_dir)
    }

    pub async fn start(&self) -> Result<Supervisor> {
        let supervisor = Supervisor::start(Arc::new(self.config.clone()), Arc::new(self.resolver.clone())).await?;
        Ok(supervisor)
    }

    /// Contexte + réconciliateur pilotés à la main (pas de boucle périodique)
    pub fn manual(&self) -> Result<ManualRun> {
        use ntpwatch::ConfigSource;

        std::fs::create_dir_all(&self.output_dir)?;
        let settings = self.config.load()?.supervisor;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sink = OutputSink::new(&self.output_dir, "manual");
        let ctx = Arc::new(SupervisorContext::new(sink, settings, shutdown_rx));
        let reconciler = Reconciler::new(ctx.clone(), Arc::new(self.config.clone()), Arc::new(self.resolver.clone()));
        Ok(ManualRun { ctx, reconciler, shutdown_tx })
    }
}

/// Superviseur "à la main": chaque appel à `reconciler.reconcile_once()` est un cycle.
pub struct ManualRun {
    pub ctx: Arc<SupervisorContext>,
    pub reconciler: Reconciler,
    shutdown_tx: watch::Sender<bool>,
}

impl ManualRun {
    /// Lève le signal d'arrêt sans rien attendre
    pub fn raise_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Signal d'arrêt puis attente de toutes les tâches
    pub async fn shutdown(self) -> usize {
        let _ = self.shutdown_tx.send(true);
        let tasks = self.ctx.supervised.lock().drain();
        let count = tasks.len();
        for task in tasks {
            let _ = task.await;
        }
        let _ = self.ctx.sink.close();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_until_times_out() {
        assert!(!wait_until(Duration::from_millis(60), || false).await);
        let mut calls = 0;
        assert!(wait_until(Duration::from_secs(1), || { calls += 1; calls > 2 }).await);
    }

    #[test]
    fn test_read_rows_orders_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("run.202401010200.csv"), "b1\nb2\n").unwrap();
        std::fs::write(dir.path().join("run.202401010100.csv"), "a1\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored\n").unwrap();

        assert_eq!(read_rows(dir.path()), vec!["a1", "b1", "b2"]);
    }

    #[test]
    fn test_script_command_uses_sh() {
        let harness = TestHarness::new().unwrap();
        let script = harness.script("noop", "exit 0").unwrap();
        let command = script.command();
        assert_eq!(command.program, PathBuf::from("/bin/sh"));
        assert_eq!(command.args, vec![script.path.display().to_string()]);
    }
}
