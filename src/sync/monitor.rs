//! Subtree monitoring.
//!
//! A monitor watches a folder for appearing and disappearing objects.
//! Against a client session it first receives an `itemFound` per existing
//! descendant entry, then `itemCreated` for everything new; deletions and
//! mode changes follow as they happen. Without a client it watches the
//! local tree directly.

use std::sync::Arc;

use parking_lot::Mutex;

use super::client::Client;
use crate::error::Result;
use crate::event::{LinkEvent, MonEvent};
use crate::handle::Handle;
use crate::mode::{LinkFlags, ObjectMode, SyncMode};
use crate::path;
use crate::registry::Registry;
use crate::wire::{RecOptions, RecordMap};

type PathCallback = Box<dyn Fn(&str) + Send + Sync>;
type ModeCallback = Box<dyn Fn(&str, ObjectMode) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    item_found: Option<PathCallback>,
    item_created: Option<PathCallback>,
    item_deleted: Option<PathCallback>,
    mode_changed: Option<ModeCallback>,
}

/// A started monitor. Dropping it stops the watch.
pub struct Monitor {
    handle: Handle,
    monitor_path: String,
    callbacks: Arc<Mutex<Callbacks>>,
}

impl Monitor {
    /// Creates an idle monitor; install callbacks, then call
    /// [`Monitor::start`] or [`Monitor::start_local`].
    pub fn new(registry: &Registry) -> Monitor {
        Monitor {
            handle: Handle::new(registry),
            monitor_path: String::new(),
            callbacks: Arc::new(Mutex::new(Callbacks::default())),
        }
    }

    pub fn set_on_item_found(&self, cb: PathCallback) {
        self.callbacks.lock().item_found = Some(cb);
    }

    pub fn set_on_item_created(&self, cb: PathCallback) {
        self.callbacks.lock().item_created = Some(cb);
    }

    pub fn set_on_item_deleted(&self, cb: PathCallback) {
        self.callbacks.lock().item_deleted = Some(cb);
    }

    pub fn set_on_mode_changed(&self, cb: ModeCallback) {
        self.callbacks.lock().mode_changed = Some(cb);
    }

    pub fn monitor_path(&self) -> &str {
        &self.monitor_path
    }

    /// Starts monitoring `path` over a client session. Remote paths in
    /// incoming events are rewritten through the client's mount covering
    /// the path.
    pub async fn start(&mut self, path_in: &str, client: &Client) -> Result<()> {
        let mut monitor_path = path::full_path(path_in);
        if !monitor_path.ends_with('/') {
            monitor_path.push('/');
        }
        self.monitor_path = monitor_path.clone();

        let (local_base, remote_base) = client
            .local_remote_of(&monitor_path)
            .unwrap_or_else(|| (monitor_path.clone(), monitor_path.clone()));

        self.install_remote_dispatch(local_base, remote_base);
        self.handle
            .open_with_flags(&monitor_path, LinkFlags::CREATE_ALLOWED | LinkFlags::FOLDER)?;

        let (net_id, is_new) = client.new_net_item(&monitor_path, SyncMode::empty()).await?;
        client.send_monitor_start(net_id, !is_new);
        Ok(())
    }

    /// Monitors the local tree without any session.
    pub fn start_local(&mut self, path_in: &str) -> Result<()> {
        let mut monitor_path = path::full_path(path_in);
        if !monitor_path.ends_with('/') {
            monitor_path.push('/');
        }
        self.monitor_path = monitor_path.clone();

        self.install_local_dispatch();
        self.handle
            .open_with_flags(&monitor_path, LinkFlags::CREATE_ALLOWED | LinkFlags::FOLDER)?;

        // Existing children are found immediately.
        let callbacks = self.callbacks.clone();
        for child in self.handle.child_items() {
            if let Some(cb) = &callbacks.lock().item_found {
                cb(&path::make_path(&monitor_path, &child));
            }
        }
        Ok(())
    }

    /// Routes monitor events arriving on the folder link into the user
    /// callbacks, translating remote to local paths. The callbacks run on
    /// the delivering session's thread.
    fn install_remote_dispatch(&self, local_base: String, remote_base: String) {
        let callbacks = self.callbacks.clone();
        self.handle.set_on_event_any_thread(Arc::new(move |ev: &LinkEvent| {
            let LinkEvent::Monitor { ev, data, is_local, .. } = ev else {
                return;
            };
            if *is_local {
                return; // only peer-announced events reach the user
            }
            let callbacks = callbacks.lock();
            match ev {
                MonEvent::ItemFound | MonEvent::ItemCreated => {
                    let remote = String::from_utf8_lossy(data).into_owned();
                    let local = path::change_base_path(&remote_base, &local_base, &remote);
                    let cb = if *ev == MonEvent::ItemFound {
                        &callbacks.item_found
                    } else {
                        &callbacks.item_created
                    };
                    if let Some(cb) = cb {
                        cb(&local);
                    }
                }
                MonEvent::ItemDeleted => {
                    let remote = String::from_utf8_lossy(data).into_owned();
                    let local = path::change_base_path(&remote_base, &local_base, &remote);
                    if let Some(cb) = &callbacks.item_deleted {
                        cb(&local);
                    }
                }
                MonEvent::ItemModeChg => {
                    let map = RecordMap::from_line(data, RecOptions::default()).unwrap_or_default();
                    let remote = map.value_string("path");
                    let local = path::change_base_path(&remote_base, &local_base, &remote);
                    let mode = ObjectMode::from_wire(map.value_or("mode", b""));
                    if let Some(cb) = &callbacks.mode_changed {
                        cb(&local, mode);
                    }
                }
                _ => {}
            }
        }));
    }

    /// Local watch: structural link events map straight onto the monitor
    /// callbacks, invoked on whatever thread creates or retires items.
    fn install_local_dispatch(&self) {
        let callbacks = self.callbacks.clone();
        self.handle.set_on_event_any_thread(Arc::new(move |ev: &LinkEvent| {
            let callbacks = callbacks.lock();
            match ev {
                LinkEvent::LinkCreated { path, is_last, .. } => {
                    if *is_last {
                        if let Some(cb) = &callbacks.item_created {
                            cb(path);
                        }
                    }
                }
                LinkEvent::Retired { start, .. } => {
                    if let Some(cb) = &callbacks.item_deleted {
                        cb(&start.path());
                    }
                }
                LinkEvent::ModeChanged { path, mode, .. } => {
                    if let Some(cb) = &callbacks.mode_changed {
                        cb(path, *mode);
                    }
                }
                _ => {}
            }
        }));
    }
}
