/*!
# ntpwatch DevKit - Stubs et utilitaires de test

Bibliothèque facilitant les tests du superviseur avec:
- Résolveur DNS statique (aucun accès réseau)
- Source de configuration en mémoire, modifiable à chaud
- Scripts d'échantillonneur `/bin/sh` jetables
- Harness regroupant le tout autour d'un répertoire temporaire
*/

pub mod config_stub;
pub mod resolver_stub;
pub mod test_utils;

pub use config_stub::MemoryConfigSource;
pub use resolver_stub::StaticResolver;
pub use test_utils::{init_test_logging, read_rows, wait_until, ManualRun, SamplerScript, TestHarness};
