use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::identity::ServerIdentity;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Lifecycle of one sampler task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SamplerState {
    /// Registered, child not spawned yet
    Starting,
    /// Child alive, output being forwarded
    Running,
    /// Child exited on its own
    Exited,
    /// Child about to be respawned
    Restarting,
    /// Stop observed, child being killed
    Stopping,
    /// Terminal
    Stopped,
}

/// Live view of a sampler, updated by its task.
#[derive(Debug, Clone, Serialize)]
pub struct SamplerStatus {
    pub state: SamplerState,
    pub restarts: u32,
    pub pid: Option<u32>,
}

impl Default for SamplerStatus {
    fn default() -> Self {
        Self { state: SamplerState::Starting, restarts: 0, pid: None }
    }
}

/// Public snapshot of one supervised server, for logs and callers.
#[derive(Debug, Clone, Serialize)]
pub struct SamplerInfo {
    pub identity: String,
    pub state: SamplerState,
    pub restarts: u32,
    pub pid: Option<u32>,
}

/// Registration of a running sampler task.
pub struct SamplerHandle {
    pub instance_id: Uuid,
    pub status: Shared<SamplerStatus>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SamplerHandle {
    pub fn new(instance_id: Uuid, status: Shared<SamplerStatus>, stop: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self { instance_id, status, stop, task }
    }

    /// Asks the sampler to stop; does not wait for it.
    fn signal_stop(&self) {
        // A closed channel means the task already ended.
        let _ = self.stop.send(true);
    }

    /// Stops and aborts a handle that never made it into the set.
    pub fn cancel(self) {
        self.signal_stop();
        self.task.abort();
    }
}

/// Identity -> running sampler. Single source of truth for what is supervised.
///
/// Handles removed from the map keep their task in `retired` until the task
/// ends, so shutdown can drain samplers that were reconciled away.
#[derive(Default)]
pub struct SupervisedSet {
    entries: HashMap<ServerIdentity, SamplerHandle>,
    retired: Vec<JoinHandle<()>>,
}

impl SupervisedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, identity: &ServerIdentity) -> bool {
        self.entries.contains_key(identity)
    }

    /// True while `identity` is still registered to this exact sampler instance.
    pub fn is_current(&self, identity: &ServerIdentity, instance_id: Uuid) -> bool {
        self.entries
            .get(identity)
            .is_some_and(|h| h.instance_id == instance_id)
    }

    pub fn identities(&self) -> impl Iterator<Item = &ServerIdentity> {
        self.entries.keys()
    }

    /// Registers a sampler. Refuses a second live entry for the same identity.
    pub fn insert(&mut self, identity: ServerIdentity, handle: SamplerHandle) -> Result<(), SamplerHandle> {
        if self.entries.contains_key(&identity) {
            return Err(handle);
        }
        self.entries.insert(identity, handle);
        Ok(())
    }

    /// Deregisters `identity`, signalling its sampler to stop.
    pub fn remove(&mut self, identity: &ServerIdentity) -> bool {
        self.retired.retain(|task| !task.is_finished());
        match self.entries.remove(identity) {
            Some(handle) => {
                handle.signal_stop();
                self.retired.push(handle.task);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<SamplerInfo> {
        let mut infos: Vec<SamplerInfo> = self
            .entries
            .iter()
            .map(|(identity, handle)| {
                let status = handle.status.lock();
                SamplerInfo {
                    identity: identity.to_string(),
                    state: status.state,
                    restarts: status.restarts,
                    pid: status.pid,
                }
            })
            .collect();
        infos.sort_by(|a, b| a.identity.cmp(&b.identity));
        infos
    }

    /// Empties the set, returning every task still to be awaited.
    pub fn drain(&mut self) -> Vec<JoinHandle<()>> {
        let mut tasks: Vec<JoinHandle<()>> = self.retired.drain(..).collect();
        tasks.extend(self.entries.drain().map(|(_, handle)| handle.task));
        tasks
    }
}
