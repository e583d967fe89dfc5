//! Best-effort persistence of save-mode objects.
//!
//! The actual store (SQLite, files, ...) lives outside this crate behind
//! the [`PersistStore`] trait, keyed by normalized path. The [`Persist`]
//! engine watches a mount subtree: a link gaining save mode is loaded from
//! the store (tagged from-persist so sync treats it as a replay) and every
//! later committed write is stored asynchronously. An in-memory store is
//! provided for tests and demos.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use moka::sync::Cache;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::event::{EventIntake, LinkEvent, WriteMeta};
use crate::handle::Handle;
use crate::mode::{LinkFlags, ObjectMode};
use crate::path;
use crate::registry::Registry;

/// The narrow interface to the external persist service.
#[async_trait]
pub trait PersistStore: Send + Sync {
    /// Store id for a path, when the path is known.
    async fn get_db_id(&self, path: &str) -> io::Result<Option<i64>>;
    /// Path and value bytes of a stored entry.
    async fn get_db_value(&self, store_id: i64) -> io::Result<Option<(String, Vec<u8>)>>;
    async fn insert_db_value(&self, path: &str, value: &[u8]) -> io::Result<i64>;
    async fn update_db_value(&self, store_id: i64, value: &[u8]) -> io::Result<()>;
    async fn update_db_used(&self, store_id: i64, used: bool) -> io::Result<()>;
    async fn update_db_mandatory(&self, store_id: i64, mandatory: bool) -> io::Result<()>;
    /// Entries that must exist in the tree even before anything references
    /// them.
    async fn mandatory_store_ids(&self) -> io::Result<Vec<i64>>;
}

enum PersistCmd {
    SetMandatory { path: String, mandatory: bool, reply: async_channel::Sender<bool> },
}

/// The persist engine for one mount subtree. Dropping it stops the watch;
/// pending stores still complete.
pub struct Persist {
    cmd_tx: mpsc::UnboundedSender<PersistCmd>,
}

impl Persist {
    /// Starts persisting under `mount_path`. Mandatory entries are loaded
    /// into the tree right away.
    pub fn start(registry: &Registry, store: Arc<dyn PersistStore>, mount_path: &str) -> Result<Persist> {
        let mount = {
            let mut m = path::full_path(mount_path);
            if !m.ends_with('/') {
                m.push('/');
            }
            m
        };

        let intake = EventIntake::new();
        let mount_handle = Handle::new(registry);
        mount_handle.set_queue_delivery(intake.clone());
        mount_handle.open_with_flags(&mount, LinkFlags::CREATE_ALLOWED | LinkFlags::FOLDER)?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = PersistTask {
            registry: registry.clone(),
            store,
            mount_handle,
            intake,
            cmd_rx,
            items: HashMap::new(),
            by_handle: HashMap::new(),
            id_cache: Cache::new(10_000),
        };
        tokio::spawn(task.run());

        Ok(Persist { cmd_tx })
    }

    /// Marks the object at `path` as mandatory in the store (or clears
    /// the mark).
    pub async fn set_mandatory(&self, path: &str, mandatory: bool) -> bool {
        let (reply, rx) = async_channel::bounded(1);
        if self
            .cmd_tx
            .send(PersistCmd::SetMandatory { path: path.to_string(), mandatory, reply })
            .is_err()
        {
            return false;
        }
        rx.recv().await.unwrap_or(false)
    }
}

struct PersistItem {
    handle: Handle,
    store_id: Option<i64>,
}

struct PersistTask {
    registry: Registry,
    store: Arc<dyn PersistStore>,
    #[allow(dead_code)]
    mount_handle: Handle,
    intake: Arc<EventIntake>,
    cmd_rx: mpsc::UnboundedReceiver<PersistCmd>,
    /// link id → tracked save item.
    items: HashMap<u32, PersistItem>,
    /// handle id → link id, for event routing.
    by_handle: HashMap<u32, u32>,
    id_cache: Cache<String, i64>,
}

impl PersistTask {
    async fn run(mut self) {
        self.load_mandatory().await;

        let intake = self.intake.clone();
        loop {
            enum Step {
                Intake,
                Cmd(Option<PersistCmd>),
            }
            let step = tokio::select! {
                _ = intake.notified() => Step::Intake,
                cmd = self.cmd_rx.recv() => Step::Cmd(cmd),
            };
            match step {
                Step::Intake => {}
                Step::Cmd(Some(cmd)) => self.handle_cmd(cmd).await,
                Step::Cmd(None) => return, // owner dropped
            }
            while let Some((core, ev)) = self.intake.pop() {
                self.handle_event(core.id(), &ev).await;
                core.apply_default_policy(&ev);
            }
        }
    }

    async fn handle_cmd(&mut self, cmd: PersistCmd) {
        match cmd {
            PersistCmd::SetMandatory { path, mandatory, reply } => {
                let ok = self.do_set_mandatory(&path, mandatory).await;
                let _ = reply.try_send(ok);
            }
        }
    }

    async fn do_set_mandatory(&mut self, path_in: &str, mandatory: bool) -> bool {
        let full = path::full_path(path_in);
        let store_id = match self.store_id_of(&full).await {
            Some(id) => id,
            None => match self.store.insert_db_value(&full, &[]).await {
                Ok(id) => {
                    self.id_cache.insert(full.clone(), id);
                    id
                }
                Err(_) => return false,
            },
        };
        if self.store.update_db_mandatory(store_id, mandatory).await.is_err() {
            return false;
        }
        if mandatory {
            self.setup_item(&full, true).await;
        }
        true
    }

    async fn load_mandatory(&mut self) {
        let ids = match self.store.mandatory_store_ids().await {
            Ok(ids) => ids,
            Err(err) => {
                tracing::warn!(error = %err, "mandatory list unavailable");
                return;
            }
        };
        for store_id in ids {
            if let Ok(Some((stored_path, _))) = self.store.get_db_value(store_id).await {
                self.id_cache.insert(stored_path.clone(), store_id);
                self.setup_item(&stored_path, true).await;
            }
        }
    }

    async fn handle_event(&mut self, handle_id: u32, ev: &LinkEvent) {
        match ev {
            LinkEvent::ModeChanged { path: ev_path, link_id, mode } => {
                if mode.contains(ObjectMode::SAVE) && !self.items.contains_key(link_id) {
                    self.setup_item(ev_path, false).await;
                }
            }
            LinkEvent::ValueChanged { meta, .. } => {
                if meta.from_persist {
                    return; // our own load echoing back
                }
                let Some(&link_id) = self.by_handle.get(&handle_id) else { return };
                self.store_item(link_id).await;
            }
            LinkEvent::Retired { is_below, .. } => {
                if *is_below {
                    return;
                }
                let Some(&link_id) = self.by_handle.get(&handle_id) else { return };
                if let Some(item) = self.items.remove(&link_id) {
                    self.by_handle.remove(&handle_id);
                    if let Some(store_id) = item.store_id {
                        let _ = self.store.update_db_used(store_id, false).await;
                    }
                }
            }
            _ => {}
        }
    }

    /// Starts tracking one save-mode object: loads the stored value, or
    /// seeds the store from the current one.
    async fn setup_item(&mut self, item_path: &str, force_save_mode: bool) {
        // Persist always acts on the value half of a pair.
        let value_path = path::provider_path_if(item_path, false);

        let handle = Handle::new(&self.registry);
        handle.set_queue_delivery(self.intake.clone());
        handle.set_uncrossed(true);
        if handle.open_with_flags_async(&value_path, LinkFlags::CREATE_ALLOWED).await.is_err() {
            return;
        }
        if force_save_mode {
            handle.set_save_mode();
        }

        let link_id = handle.link_id();
        if self.items.contains_key(&link_id) {
            return;
        }

        let store_id = match self.store_id_of(&value_path).await {
            Some(store_id) => {
                if let Ok(Some((_, value))) = self.store.get_db_value(store_id).await {
                    if !value.is_empty() {
                        let meta = WriteMeta { from_persist: true, ..Default::default() };
                        handle.import(&value, Some(false), meta);
                    }
                }
                let _ = self.store.update_db_used(store_id, true).await;
                Some(store_id)
            }
            None => match self.store.insert_db_value(&value_path, &handle.export()).await {
                Ok(store_id) => {
                    self.id_cache.insert(value_path.clone(), store_id);
                    Some(store_id)
                }
                Err(err) => {
                    tracing::warn!(path = %value_path, error = %err, "persist insert failed");
                    None
                }
            },
        };

        self.by_handle.insert(handle.id(), link_id);
        self.items.insert(link_id, PersistItem { handle, store_id });
    }

    async fn store_item(&mut self, link_id: u32) {
        let (data, store_id, item_path) = match self.items.get(&link_id) {
            Some(item) => (item.handle.export(), item.store_id, item.handle.path()),
            None => return,
        };
        let store_id = match store_id {
            Some(id) => id,
            None => match self.store.insert_db_value(&item_path, &data).await {
                Ok(id) => {
                    self.id_cache.insert(item_path, id);
                    if let Some(item) = self.items.get_mut(&link_id) {
                        item.store_id = Some(id);
                    }
                    return;
                }
                Err(_) => return,
            },
        };
        if let Err(err) = self.store.update_db_value(store_id, &data).await {
            tracing::warn!(error = %err, "persist update failed");
        }
    }

    async fn store_id_of(&self, item_path: &str) -> Option<i64> {
        if let Some(id) = self.id_cache.get(item_path) {
            return Some(id);
        }
        match self.store.get_db_id(item_path).await {
            Ok(Some(id)) => {
                self.id_cache.insert(item_path.to_string(), id);
                Some(id)
            }
            _ => None,
        }
    }
}

/// Hash-map backed store for tests and demos.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    next_id: i64,
    entries: HashMap<i64, MemoryEntry>,
    by_path: HashMap<String, i64>,
}

struct MemoryEntry {
    path: String,
    value: Vec<u8>,
    used: bool,
    mandatory: bool,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn value_of(&self, path: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        let id = inner.by_path.get(path)?;
        inner.entries.get(id).map(|e| e.value.clone())
    }
}

#[async_trait]
impl PersistStore for MemoryStore {
    async fn get_db_id(&self, path: &str) -> io::Result<Option<i64>> {
        Ok(self.inner.lock().by_path.get(path).copied())
    }

    async fn get_db_value(&self, store_id: i64) -> io::Result<Option<(String, Vec<u8>)>> {
        Ok(self
            .inner
            .lock()
            .entries
            .get(&store_id)
            .map(|e| (e.path.clone(), e.value.clone())))
    }

    async fn insert_db_value(&self, path: &str, value: &[u8]) -> io::Result<i64> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.entries.insert(
            id,
            MemoryEntry { path: path.to_string(), value: value.to_vec(), used: true, mandatory: false },
        );
        inner.by_path.insert(path.to_string(), id);
        Ok(id)
    }

    async fn update_db_value(&self, store_id: i64, value: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&store_id) {
            Some(entry) => {
                entry.value = value.to_vec();
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "unknown store id")),
        }
    }

    async fn update_db_used(&self, store_id: i64, used: bool) -> io::Result<()> {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&store_id) {
            Some(entry) => {
                entry.used = used;
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "unknown store id")),
        }
    }

    async fn update_db_mandatory(&self, store_id: i64, mandatory: bool) -> io::Result<()> {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&store_id) {
            Some(entry) => {
                entry.mandatory = mandatory;
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "unknown store id")),
        }
    }

    async fn mandatory_store_ids(&self) -> io::Result<Vec<i64>> {
        Ok(self
            .inner
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| e.mandatory)
            .map(|(id, _)| *id)
            .collect())
    }
}
