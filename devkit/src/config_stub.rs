/*!
Source de configuration en mémoire

Remplace le fichier YAML dans les tests. La configuration peut être
modifiée (ajout/retrait de serveurs) ou rendue indisponible pendant que le
superviseur tourne; chaque cycle de réconciliation relit l'état courant.
*/

use ntpwatch::config::{IntervalSetting, OutputConf, SupervisorConf};
use ntpwatch::{ConfigError, ConfigSource, MonitorConfig};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct MemoryConfigSource {
    current: Arc<Mutex<Option<MonitorConfig>>>,
}

impl MemoryConfigSource {
    /// Configuration with an output directory and an empty server list.
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        let config = MonitorConfig {
            output: Some(OutputConf { base_path: base_path.as_ref().to_path_buf() }),
            servers: Some(BTreeMap::new()),
            supervisor: SupervisorConf::default(),
        };
        Self { current: Arc::new(Mutex::new(Some(config))) }
    }

    pub fn from_config(config: MonitorConfig) -> Self {
        Self { current: Arc::new(Mutex::new(Some(config))) }
    }

    fn update(&self, f: impl FnOnce(&mut MonitorConfig)) {
        let mut current = self.current.lock().unwrap();
        let config = current.get_or_insert_with(MonitorConfig::default);
        f(config);
    }

    /// Ajoute (ou remplace) un serveur; `None` = intervalle par défaut
    pub fn add_server(&self, name: &str, interval_ms: Option<u64>) -> &Self {
        self.update(|c| {
            c.servers
                .get_or_insert_with(BTreeMap::new)
                .insert(name.to_string(), interval_ms.map(IntervalSetting::Millis));
        });
        self
    }

    pub fn remove_server(&self, name: &str) -> &Self {
        self.update(|c| {
            if let Some(servers) = c.servers.as_mut() {
                servers.remove(name);
            }
        });
        self
    }

    pub fn set_supervisor(&self, conf: SupervisorConf) -> &Self {
        self.update(|c| c.supervisor = conf);
        self
    }

    /// Retire toute la section `servers`
    pub fn drop_servers_section(&self) -> &Self {
        self.update(|c| c.servers = None);
        self
    }

    /// Simule une source injoignable
    pub fn make_unavailable(&self) {
        *self.current.lock().unwrap() = None;
    }
}

impl ConfigSource for MemoryConfigSource {
    fn load(&self) -> Result<MonitorConfig, ConfigError> {
        self.current.lock().unwrap().clone().ok_or_else(|| ConfigError::Unavailable {
            path: "<memory>".into(),
            source: io::Error::new(io::ErrorKind::NotFound, "configuration removed"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_source_edits() {
        let source = MemoryConfigSource::new("/tmp/out");
        source.add_server("alpha", Some(1000)).add_server("localhost", None);

        let entries = source.load().unwrap().server_entries().unwrap();
        assert_eq!(entries.len(), 2);

        source.remove_server("alpha");
        let entries = source.load().unwrap().server_entries().unwrap();
        assert_eq!(entries[0].name, "localhost");

        source.make_unavailable();
        assert!(matches!(source.load(), Err(ConfigError::Unavailable { .. })));
    }
}
