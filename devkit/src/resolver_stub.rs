/*!
Résolveur statique pour tests sans DNS

Les réponses directes et inverses sont déclarées à l'avance; un nom ou une
adresse absente de la table échoue comme un vrai NXDOMAIN. Clonable: toutes
les copies partagent la même table, le test peut donc la modifier pendant
que le superviseur tourne.
*/

use ntpwatch::{ResolveError, Resolver};
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Table {
    forward: HashMap<String, Vec<IpAddr>>,
    reverse: HashMap<IpAddr, String>,
    forward_calls: HashMap<String, usize>,
}

#[derive(Clone, Default)]
pub struct StaticResolver {
    table: Arc<Mutex<Table>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Déclare les adresses d'un nom
    pub fn host(&self, name: &str, addrs: &[&str]) -> &Self {
        let addrs = addrs.iter().map(|a| a.parse().expect("valid IP literal")).collect();
        self.table.lock().unwrap().forward.insert(name.to_string(), addrs);
        self
    }

    /// Déclare le nom inverse d'une adresse
    pub fn ptr(&self, addr: &str, name: &str) -> &Self {
        let addr: IpAddr = addr.parse().expect("valid IP literal");
        self.table.lock().unwrap().reverse.insert(addr, name.to_string());
        self
    }

    /// Raccourci: une adresse et son nom inverse
    pub fn server(&self, name: &str, addr: &str, reverse_name: &str) -> &Self {
        self.host(name, &[addr]).ptr(addr, reverse_name)
    }

    /// Fait échouer la résolution directe d'un nom
    pub fn forget(&self, name: &str) -> &Self {
        self.table.lock().unwrap().forward.remove(name);
        self
    }

    pub fn forward_calls(&self, name: &str) -> usize {
        self.table.lock().unwrap().forward_calls.get(name).copied().unwrap_or(0)
    }
}

impl Resolver for StaticResolver {
    fn forward(&self, name: &str) -> Result<Vec<IpAddr>, ResolveError> {
        let mut table = self.table.lock().unwrap();
        *table.forward_calls.entry(name.to_string()).or_default() += 1;
        table.forward.get(name).cloned().ok_or_else(|| ResolveError::Forward {
            name: name.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "host not found"),
        })
    }

    fn reverse(&self, address: IpAddr) -> Result<String, ResolveError> {
        self.table.lock().unwrap().reverse.get(&address).cloned().ok_or_else(|| ResolveError::Reverse {
            address,
            source: io::Error::new(io::ErrorKind::NotFound, "no PTR record"),
        })
    }
}
