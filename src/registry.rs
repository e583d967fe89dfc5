//! The registry: tree root, lifecycle and the registry thread.
//!
//! A [`Registry`] is an owned engine value; tests and applications may run
//! several isolated registries in one process. All structural mutation of
//! the tree (create, twin attach, retire, delete) happens on the registry
//! thread. Calls from other threads are proxied over a request channel and
//! block (or `await`) on a per-call reply slot.

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::Duration;

use crate::error::{ErrCode, Error, ErrorLog, Result};
use crate::link::Link;
use crate::mode::{LinkFlags, RetireKind, SyncMode};
use crate::path;

const METRICS_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) enum RegistryMsg {
    Lookup {
        path: String,
        flags: LinkFlags,
        sync_mode: SyncMode,
        reply: async_channel::Sender<Result<Arc<Link>>>,
    },
    AddTwin {
        link: Arc<Link>,
        sync_mode: SyncMode,
        flags: LinkFlags,
        reply: async_channel::Sender<Result<Arc<Link>>>,
    },
    Destroy {
        link: Arc<Link>,
        is_global: bool,
    },
    DestroyPath {
        path: String,
        is_global: bool,
    },
    Items {
        path: String,
        reply: async_channel::Sender<Vec<String>>,
    },
    ZeroRef {
        link: Arc<Link>,
    },
    MetricsTick,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub folders: AtomicI64,
    pub leaves: AtomicI64,
    pub refs: AtomicI64,
}

pub(crate) struct RegShared {
    tx: async_channel::Sender<RegistryMsg>,
    root: OnceLock<Arc<Link>>,
    err: Arc<ErrorLog>,
    counters: Counters,
    default_ignore_same: AtomicBool,
    reg_thread: OnceLock<thread::ThreadId>,
}

/// Cheap per-link access back into the registry: zero-ref scheduling,
/// error logging and object counting. Holds only a weak reference so the
/// tree cannot keep a dropped registry alive.
#[derive(Clone)]
pub(crate) struct RegistryHook {
    shared: Weak<RegShared>,
}

impl RegistryHook {
    pub fn post_zero_ref(&self, link: Arc<Link>) {
        if let Some(shared) = self.shared.upgrade() {
            let _ = shared.tx.try_send(RegistryMsg::ZeroRef { link });
        }
    }

    pub fn log(&self, text: &str, code: ErrCode) {
        if let Some(shared) = self.shared.upgrade() {
            shared.err.log(text, code);
        }
    }

    pub fn count_ref(&self, step: i64) {
        if let Some(shared) = self.shared.upgrade() {
            shared.counters.refs.fetch_add(step, Ordering::Relaxed);
        }
    }
}

/// The engine owning one shared object tree.
#[derive(Clone)]
pub struct Registry {
    shared: Arc<RegShared>,
}

impl Registry {
    pub fn new() -> Registry {
        let (tx, rx) = async_channel::unbounded();
        let shared = Arc::new(RegShared {
            tx,
            root: OnceLock::new(),
            err: ErrorLog::new(),
            counters: Counters::default(),
            default_ignore_same: AtomicBool::new(false),
            reg_thread: OnceLock::new(),
        });

        let hook = RegistryHook { shared: Arc::downgrade(&shared) };
        let root = Link::new(None, "", LinkFlags::FOLDER, hook);
        shared.root.set(root).ok();

        let loop_shared = Arc::downgrade(&shared);
        let handle = thread::Builder::new()
            .name("registry".into())
            .spawn(move || registry_loop(rx, loop_shared))
            .expect("spawn registry thread");
        shared.reg_thread.set(handle.thread().id()).ok();

        // Low-rate ticker refreshing the metric leaves. Holds only a weak
        // sender, so it winds down with the registry.
        let tick_tx = shared.tx.downgrade();
        thread::Builder::new()
            .name("registry-metrics".into())
            .spawn(move || loop {
                thread::sleep(METRICS_INTERVAL);
                let Some(tx) = tick_tx.upgrade() else { break };
                if tx.try_send(RegistryMsg::MetricsTick).is_err() {
                    break;
                }
            })
            .expect("spawn metrics thread");

        let reg = Registry { shared };
        reg.post_setup();
        reg
    }

    fn post_setup(&self) {
        let legal = format!("{}{}", path::PATH_LOCAL, path::PATH_LEGAL);
        self.set_string(&format!("{}Name/value", legal), env!("CARGO_PKG_NAME"));
        self.set_string(&format!("{}Version/value", legal), env!("CARGO_PKG_VERSION"));
    }

    pub(crate) fn hook(&self) -> RegistryHook {
        RegistryHook { shared: Arc::downgrade(&self.shared) }
    }

    pub fn root(&self) -> Arc<Link> {
        self.shared.root.get().expect("registry root").clone()
    }

    pub fn error_log(&self) -> &ErrorLog {
        &self.shared.err
    }

    pub fn log_error(&self, text: &str, code: ErrCode) {
        self.shared.err.log(text, code);
    }

    pub fn set_default_ignore_same_value(&self, is_ignore: bool) {
        self.shared.default_ignore_same.store(is_ignore, Ordering::Relaxed);
    }

    pub fn default_ignore_same_value(&self) -> bool {
        self.shared.default_ignore_same.load(Ordering::Relaxed)
    }

    fn is_registry_thread(&self) -> bool {
        self.shared.reg_thread.get() == Some(&thread::current().id())
    }

    // ---- lookup -------------------------------------------------------

    /// Resolves (and possibly creates) the link at `path`. Blocks the
    /// caller while the registry thread performs the structural work. A
    /// call from any other thread marks the visited links as threaded.
    pub fn open_link(&self, path: &str, flags: LinkFlags, sync_mode: SyncMode) -> Result<Arc<Link>> {
        if self.is_registry_thread() {
            return link_main(&self.shared, path, flags, sync_mode);
        }
        let flags = flags | LinkFlags::THREADED;
        let (reply, rx) = async_channel::bounded(1);
        self.send(RegistryMsg::Lookup { path: path.to_string(), flags, sync_mode, reply })?;
        rx.recv_blocking().map_err(closed_err)?
    }

    /// Async flavor of [`Registry::open_link`] for session tasks, which
    /// never run on the registry thread.
    pub async fn open_link_async(
        &self,
        path: &str,
        flags: LinkFlags,
        sync_mode: SyncMode,
    ) -> Result<Arc<Link>> {
        let flags = flags | LinkFlags::THREADED;
        let (reply, rx) = async_channel::bounded(1);
        self.send(RegistryMsg::Lookup { path: path.to_string(), flags, sync_mode, reply })?;
        rx.recv().await.map_err(closed_err)?
    }

    /// Makes sure `link` has its twin, creating and cross-pairing it when
    /// missing. Returns the twin, referenced.
    pub fn add_twin(&self, link: &Arc<Link>, sync_mode: SyncMode, flags: LinkFlags) -> Result<Arc<Link>> {
        if self.is_registry_thread() {
            let twin = add_twin_main(&self.shared, link, sync_mode, flags)?;
            twin.ref_inc();
            return Ok(twin);
        }
        let flags = flags | LinkFlags::THREADED;
        let (reply, rx) = async_channel::bounded(1);
        self.send(RegistryMsg::AddTwin { link: link.clone(), sync_mode, flags, reply })?;
        rx.recv_blocking().map_err(closed_err)?
    }

    // ---- destroy ------------------------------------------------------

    /// Retires the subtree at `link`. Deletion follows on zero-ref.
    pub fn destroy_link(&self, link: &Arc<Link>, is_global: bool) {
        if self.is_registry_thread() {
            destroy_link_main(&self.shared, link, link, is_global);
            return;
        }
        let _ = self.send(RegistryMsg::Destroy { link: link.clone(), is_global });
    }

    pub fn destroy_path(&self, path: &str, is_global: bool) {
        if self.is_registry_thread() {
            if let Ok(link) = link_main(&self.shared, path, LinkFlags::SILENT_ERROR, SyncMode::empty()) {
                link.ref_dec();
                destroy_link_main(&self.shared, &link, &link, is_global);
            }
            return;
        }
        let _ = self.send(RegistryMsg::DestroyPath { path: path.to_string(), is_global });
    }

    // ---- inspection ---------------------------------------------------

    /// Child names of the folder at `path`; folders carry a trailing `/`.
    pub fn items(&self, path: &str) -> Vec<String> {
        if self.is_registry_thread() {
            return items_main(&self.shared, path);
        }
        let (reply, rx) = async_channel::bounded(1);
        if self.send(RegistryMsg::Items { path: path.to_string(), reply }).is_err() {
            return Vec::new();
        }
        rx.recv_blocking().unwrap_or_default()
    }

    pub async fn items_async(&self, path: &str) -> Vec<String> {
        let (reply, rx) = async_channel::bounded(1);
        if self.send(RegistryMsg::Items { path: path.to_string(), reply }).is_err() {
            return Vec::new();
        }
        rx.recv().await.unwrap_or_default()
    }

    pub fn exists(&self, path: &str) -> bool {
        match self.open_link(path, LinkFlags::SILENT_ERROR, SyncMode::empty()) {
            Ok(link) => {
                link.ref_dec();
                true
            }
            Err(_) => false,
        }
    }

    pub fn is_folder(&self, path: &str) -> bool {
        match self.open_link(path, LinkFlags::FOLDER | LinkFlags::SILENT_ERROR, SyncMode::empty()) {
            Ok(link) => {
                link.ref_dec();
                true
            }
            Err(_) => false,
        }
    }

    pub fn is_leaf(&self, path: &str) -> bool {
        if path::is_folder_path(path) {
            return false;
        }
        self.exists(path)
    }

    pub fn set_atomic_op_provider(&self, path: &str) {
        if path::is_folder_path(path) {
            return;
        }
        if let Ok(link) = self.open_link(path, LinkFlags::CREATE_ALLOWED, SyncMode::empty()) {
            link.set_atomic_op_provider(true);
            link.ref_dec();
        }
    }

    // ---- value convenience --------------------------------------------

    pub fn get_int(&self, path: &str) -> Option<i64> {
        let link = self.open_link(path, LinkFlags::CREATE_ALLOWED, SyncMode::empty()).ok()?;
        let ret = link.to_int();
        link.ref_dec();
        ret
    }

    pub fn get_real(&self, path: &str) -> Option<f64> {
        let link = self.open_link(path, LinkFlags::CREATE_ALLOWED, SyncMode::empty()).ok()?;
        let ret = link.to_real();
        link.ref_dec();
        ret
    }

    pub fn get_string(&self, path: &str) -> Option<String> {
        let link = self.open_link(path, LinkFlags::CREATE_ALLOWED, SyncMode::empty()).ok()?;
        let ret = link.to_string_val();
        link.ref_dec();
        ret
    }

    pub fn get_bytes(&self, path: &str) -> Option<Vec<u8>> {
        let link = self.open_link(path, LinkFlags::CREATE_ALLOWED, SyncMode::empty()).ok()?;
        let ret = link.to_bytes();
        link.ref_dec();
        ret
    }

    pub fn set_int(&self, path: &str, value: i64) {
        if let Ok(link) = self.open_link(path, LinkFlags::CREATE_ALLOWED, SyncMode::empty()) {
            link.set_int(value, 0, false);
            link.ref_dec();
        }
    }

    pub fn set_real(&self, path: &str, value: f64) {
        if let Ok(link) = self.open_link(path, LinkFlags::CREATE_ALLOWED, SyncMode::empty()) {
            link.set_real(value, 0, false);
            link.ref_dec();
        }
    }

    pub fn set_string(&self, path: &str, value: &str) {
        if let Ok(link) = self.open_link(path, LinkFlags::CREATE_ALLOWED, SyncMode::empty()) {
            link.set_string(value, 0, false, crate::event::WriteMeta::null());
            link.ref_dec();
        }
    }

    pub fn set_bytes(&self, path: &str, value: &[u8]) {
        if let Ok(link) = self.open_link(path, LinkFlags::CREATE_ALLOWED, SyncMode::empty()) {
            link.set_bytes(value, 0, false, crate::event::WriteMeta::null());
            link.ref_dec();
        }
    }

    fn send(&self, msg: RegistryMsg) -> Result<()> {
        self.shared
            .tx
            .try_send(msg)
            .map_err(|_| Error::new(ErrCode::ConnectionError, "registry stopped"))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

fn closed_err<E>(_: E) -> Error {
    Error::new(ErrCode::ConnectionError, "registry stopped")
}

// ---- registry thread ---------------------------------------------------

fn registry_loop(rx: async_channel::Receiver<RegistryMsg>, shared: Weak<RegShared>) {
    while let Ok(msg) = rx.recv_blocking() {
        let Some(shared) = shared.upgrade() else { break };
        match msg {
            RegistryMsg::Lookup { path, flags, sync_mode, reply } => {
                let ret = link_main(&shared, &path, flags, sync_mode);
                let _ = reply.try_send(ret);
            }
            RegistryMsg::AddTwin { link, sync_mode, flags, reply } => {
                let ret = add_twin_main(&shared, &link, sync_mode, flags).map(|twin| {
                    twin.ref_inc();
                    twin
                });
                let _ = reply.try_send(ret);
            }
            RegistryMsg::Destroy { link, is_global } => {
                destroy_link_main(&shared, &link, &link, is_global);
            }
            RegistryMsg::DestroyPath { path, is_global } => {
                if let Ok(link) = link_main(&shared, &path, LinkFlags::SILENT_ERROR, SyncMode::empty()) {
                    link.ref_dec();
                    destroy_link_main(&shared, &link, &link, is_global);
                }
            }
            RegistryMsg::Items { path, reply } => {
                let _ = reply.try_send(items_main(&shared, &path));
            }
            RegistryMsg::ZeroRef { link } => {
                do_zero_ref_link(&shared, link);
            }
            RegistryMsg::MetricsTick => {
                update_metrics(&shared);
            }
        }
    }
    tracing::debug!("registry thread stopped");
}

fn root_of(shared: &Arc<RegShared>) -> Arc<Link> {
    shared.root.get().expect("registry root").clone()
}

fn update_metrics(shared: &Arc<RegShared>) {
    let base = format!("{}Sys/Metric/", path::PATH_LOCAL);
    let set = |name: &str, value: i64| {
        let p = format!("{}{}/value", base, name);
        if let Ok(link) = link_main(shared, &p, LinkFlags::CREATE_ALLOWED, SyncMode::empty()) {
            link.set_int(value, 0, false);
            link.ref_dec();
        }
    };
    set("ObjectFolders", shared.counters.folders.load(Ordering::Relaxed));
    set("ObjectLeaves", shared.counters.leaves.load(Ordering::Relaxed));
    set("ObjectRef", shared.counters.refs.load(Ordering::Relaxed));
}

/// Path walk with lazy creation. Registry thread only.
fn link_main(
    shared: &Arc<RegShared>,
    path_in: &str,
    flags: LinkFlags,
    sync_mode: SyncMode,
) -> Result<Arc<Link>> {
    let mut flags = flags;
    let mut path_norm = path::full_path(path_in);
    if path_norm.ends_with('/') {
        flags |= LinkFlags::FOLDER;
        path_norm.pop(); // root becomes ""
    }

    let mut current = root_of(shared);
    let segments: Vec<&str> = path_norm.split('/').collect();
    let mut grow_path = String::from("/");

    for (i, segment) in segments.iter().enumerate().skip(1) {
        let is_last = i == segments.len() - 1;
        let mut sub_flags = flags;
        sub_flags.set(LinkFlags::FOLDER, flags.contains(LinkFlags::FOLDER) || !is_last);
        sub_flags.set(LinkFlags::LAST_LINK, is_last);

        grow_path.push_str(segment);
        if sub_flags.contains(LinkFlags::FOLDER) {
            grow_path.push('/');
        }

        let child = get_raw_link(shared, &current, segment, sub_flags)?;

        if !sub_flags.contains(LinkFlags::FOLDER)
            && segment.ends_with('!')
            && sub_flags.contains(LinkFlags::CREATE_ALLOWED)
        {
            // A provider leaf always gets its value twin.
            add_twin_main(shared, &child, sync_mode, sub_flags)?;
        }

        child.setup_end(&grow_path, sync_mode, sub_flags);
        current = child;
    }

    current.ref_inc();
    Ok(current)
}

/// Finds or creates one child. Registry thread only.
fn get_raw_link(
    shared: &Arc<RegShared>,
    parent: &Arc<Link>,
    name: &str,
    flags: LinkFlags,
) -> Result<Arc<Link>> {
    let silent = flags.contains(LinkFlags::SILENT_ERROR);
    let fail = |code: ErrCode, msg: String| -> Error {
        if !silent {
            shared.err.log(&msg, code);
        }
        Error::new(code, msg)
    };

    if parent.is_retired() {
        return Err(fail(ErrCode::Retired, format!("parent: {}", parent.path())));
    }

    match parent.find_child(name) {
        None => {
            if !flags.contains(LinkFlags::CREATE_ALLOWED) {
                return Err(fail(
                    ErrCode::NotFound,
                    format!("Path: {} Item: {}", parent.path(), name),
                ));
            }
            if name.is_empty() && !flags.contains(LinkFlags::FOLDER) {
                return Err(fail(
                    ErrCode::CreateError,
                    format!("Empty leaf name, Path: {}", parent.path()),
                ));
            }
            if name.ends_with("!!") {
                return Err(fail(
                    ErrCode::CreateError,
                    format!("Invalid name, Path: {}", parent.path()),
                ));
            }
            let hook = RegistryHook { shared: Arc::downgrade(shared) };
            let child = Link::new(Some(parent), name, flags, hook);
            if flags.contains(LinkFlags::FOLDER) {
                shared.counters.folders.fetch_add(1, Ordering::Relaxed);
            } else {
                shared.counters.leaves.fetch_add(1, Ordering::Relaxed);
            }
            Ok(child)
        }
        Some(child) => {
            if child.is_retired() {
                return Err(fail(ErrCode::Retired, format!("child: {}", child.path())));
            }
            if child.is_folder() != flags.contains(LinkFlags::FOLDER) {
                let msg = if flags.contains(LinkFlags::FOLDER) {
                    format!("Is not folder, Path: {}", child.path())
                } else {
                    format!("Is folder, Path: {}", child.path())
                };
                return Err(fail(ErrCode::CreateError, msg));
            }
            Ok(child)
        }
    }
    .map(|child| {
        // A lookup from another thread makes the pair (and the spine up
        // to the root) threaded.
        if flags.contains(LinkFlags::THREADED) {
            child.set_threaded();
            if let Some(twin) = child.twin_link() {
                twin.set_threaded();
            }
        }
        child
    })
}

/// Creates and cross-pairs the twin of `link` when missing. Registry
/// thread only. Returns the twin without referencing it.
fn add_twin_main(
    shared: &Arc<RegShared>,
    link: &Arc<Link>,
    sync_mode: SyncMode,
    flags: LinkFlags,
) -> Result<Arc<Link>> {
    if let Some(twin) = link.twin_link() {
        return Ok(twin);
    }

    let parent = link
        .parent()
        .ok_or_else(|| Error::new(ErrCode::FolderNotOpen, "twin of root".to_string()))?;
    let twin_name = link.twin_name();
    let twin = get_raw_link(shared, &parent, &twin_name, flags | LinkFlags::CREATE_ALLOWED)?;

    twin.set_twin(link);
    link.set_twin(&twin);

    let twin_path = path::twin_path(&format!("{}{}", parent.path(), link.name()));
    twin.setup_end(&twin_path, sync_mode, flags | LinkFlags::LAST_LINK);
    link.do_mode_changed(); // the pair is now bidirectional

    Ok(twin)
}

/// Recursive retirement. Registry thread only; deletion is deferred to
/// the zero-ref pass.
fn destroy_link_main(shared: &Arc<RegShared>, link: &Arc<Link>, start: &Arc<Link>, is_global: bool) {
    if link.is_retired() {
        return;
    }

    let kind = if start.is_folder() {
        RetireKind::Tree
    } else if is_global {
        RetireKind::LeafGlobal
    } else {
        RetireKind::LeafLocal
    };

    let twin = link.twin_link();
    link.set_retired(kind);
    if let Some(twin) = &twin {
        twin.set_retired(kind);
    }
    link.ref_inc(); // protect while recursing

    loop {
        let next = link.children().into_iter().find(|c| !c.is_retired());
        match next {
            Some(child) => destroy_link_main(shared, &child, start, is_global),
            None => break,
        }
    }

    link.do_retired(start, is_global);
    if let Some(twin) = &twin {
        twin.do_retired(start, is_global);
    }
    link.ref_dec(); // may schedule the zero-ref delete
}

/// Deletes a fully de-referenced retired link and collapses empty retired
/// spines bottom-up. Registry thread only.
fn do_zero_ref_link(shared: &Arc<RegShared>, link: Arc<Link>) {
    link.dec_zero_refs();
    if !link.is_last_zero_ref() {
        return; // link was reused, more zero-refs will come
    }

    link.set_ref_count(-1);

    let mut link = link;
    while link.is_retired() && link.ref_count() < 0 && link.children().is_empty() {
        let parent = link.parent();
        tracing::debug!(path = %link.path(), "delete link");

        if link.is_folder() {
            shared.counters.folders.fetch_sub(1, Ordering::Relaxed);
        } else {
            shared.counters.leaves.fetch_sub(1, Ordering::Relaxed);
            if link.is_bidir_mode() {
                shared.counters.leaves.fetch_sub(1, Ordering::Relaxed);
            }
        }

        if let Some(twin) = link.twin_link() {
            twin.clear_twin();
            link.clear_twin();
            if let Some(parent) = &parent {
                parent.remove_child(&twin);
            }
        }
        if let Some(parent) = &parent {
            parent.remove_child(&link);
        }

        match parent {
            Some(p) => link = p,
            None => break,
        }
    }
}

fn items_main(shared: &Arc<RegShared>, path_in: &str) -> Vec<String> {
    match link_main(shared, path_in, LinkFlags::FOLDER | LinkFlags::SILENT_ERROR, SyncMode::empty()) {
        Ok(link) => {
            let ret = link
                .children()
                .iter()
                .map(|c| {
                    if c.is_folder() {
                        format!("{}/", c.name())
                    } else {
                        c.name().to_string()
                    }
                })
                .collect();
            link.ref_dec();
            ret
        }
        Err(_) => Vec::new(),
    }
}
