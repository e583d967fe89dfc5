//! A node in the shared object tree.
//!
//! Links are owned downward (a folder holds `Arc`s to its children); parent
//! and twin references are weak, so the only owner of tree structure is the
//! registry. The handle refcount lives on the value half of a twin pair and
//! is tracked explicitly; actual destruction happens on the registry thread
//! only (see `registry`).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::event::{AtomicOp, LinkEvent, WriteMeta};
use crate::handle::{ExportCode, HandleCore};
use crate::mode::{LinkFlags, ObjectMode, RetireKind, SyncMode};
use crate::path::{convert_base_name, NameFormat};
use crate::registry::RegistryHook;
use crate::value::{format_real, Cell, DataType, Variant};

static LINK_ID: AtomicU32 = AtomicU32::new(1);

pub(crate) struct Subscriber {
    pub handle_id: u32,
    pub target: Weak<HandleCore>,
}

pub(crate) struct LinkInner {
    pub cell: Option<Cell>,
    pub is_pipe: bool,
    pub is_save: bool,
    pub is_atomic_op_provider: bool,
    pub sync_mode: SyncMode,
    pub has_been_setup: bool,
    pub retired: RetireKind,
    pub is_retired: bool,
    /// -1 marks "never referenced", deletable.
    pub ref_count: i32,
    pub zero_ref_count: i32,
    pub subscribers: Vec<Subscriber>,
}

pub struct Link {
    id: u32,
    name: String,
    is_folder: bool,
    is_provider: bool,
    parent: Weak<Link>,
    children: Mutex<Vec<Arc<Link>>>,
    twin: Mutex<Weak<Link>>,
    inner: Mutex<LinkInner>,
    /// Set once any handle on this link (or one below) was opened from
    /// outside the registry thread; event dispatch then checks each
    /// subscriber's thread affinity.
    threaded: AtomicBool,
    hook: RegistryHook,
}

impl Link {
    pub(crate) fn new(
        parent: Option<&Arc<Link>>,
        name: &str,
        flags: LinkFlags,
        hook: RegistryHook,
    ) -> Arc<Link> {
        let name = convert_base_name(name, NameFormat::DEFAULT);
        let is_folder = flags.contains(LinkFlags::FOLDER);
        let is_provider = name.ends_with('!');

        let link = Arc::new(Link {
            id: LINK_ID.fetch_add(1, Ordering::Relaxed),
            name,
            is_folder,
            is_provider,
            parent: parent.map(Arc::downgrade).unwrap_or_default(),
            children: Mutex::new(Vec::new()),
            twin: Mutex::new(Weak::new()),
            inner: Mutex::new(LinkInner {
                cell: if is_folder { None } else { Some(Cell::new()) },
                is_pipe: false,
                is_save: false,
                is_atomic_op_provider: false,
                sync_mode: SyncMode::empty(),
                has_been_setup: false,
                retired: RetireKind::None,
                is_retired: false,
                ref_count: -1,
                zero_ref_count: 0,
                subscribers: Vec::new(),
            }),
            threaded: AtomicBool::new(false),
            hook,
        });

        if let Some(parent) = parent {
            parent.children.lock().push(link.clone());
        }
        link
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_folder(&self) -> bool {
        self.is_folder
    }

    pub fn is_provider(&self) -> bool {
        self.is_provider
    }

    pub fn parent(&self) -> Option<Arc<Link>> {
        self.parent.upgrade()
    }

    pub fn children(&self) -> Vec<Arc<Link>> {
        self.children.lock().clone()
    }

    pub(crate) fn remove_child(&self, child: &Arc<Link>) {
        self.children.lock().retain(|c| !Arc::ptr_eq(c, child));
    }

    pub fn find_child(&self, name: &str) -> Option<Arc<Link>> {
        let name = convert_base_name(name, NameFormat::DEFAULT);
        self.children.lock().iter().find(|c| c.name == name).cloned()
    }

    /// The segment name with a folder mark when applicable.
    pub fn link_name(&self, fmt: NameFormat) -> String {
        let mut ret = convert_base_name(&self.name, fmt);
        if self.is_folder && !fmt.no_folder_mark {
            ret.push('/');
        }
        ret
    }

    /// The full path of this link, walking parents back to root.
    pub fn path(&self) -> String {
        self.path_with(NameFormat::DEFAULT)
    }

    pub fn path_with(&self, fmt: NameFormat) -> String {
        let mut fmt = fmt;
        fmt.no_folder_mark = false;

        let mut parts: Vec<String> = Vec::new();
        let mut cur: Option<Arc<Link>> = None;
        loop {
            let (link_name, parent) = match &cur {
                None => (None, self.parent()),
                Some(link) => (Some(link.clone()), link.parent()),
            };
            let mut seg_fmt = fmt;
            let at_root = parent.is_none();
            if at_root {
                if fmt.relative {
                    break;
                }
                seg_fmt.empty_ok = true;
            }
            let name = match &link_name {
                None => self.link_name(seg_fmt),
                Some(link) => link.link_name(seg_fmt),
            };
            parts.push(name);
            match parent {
                Some(p) => cur = Some(p),
                None => break,
            }
        }
        parts.reverse();
        parts.concat()
    }

    // ---- twin pair ----------------------------------------------------

    pub fn twin_link(&self) -> Option<Arc<Link>> {
        self.twin.lock().upgrade()
    }

    pub(crate) fn set_twin(&self, twin: &Arc<Link>) {
        *self.twin.lock() = Arc::downgrade(twin);
    }

    pub(crate) fn clear_twin(&self) {
        *self.twin.lock() = Weak::new();
    }

    /// The value half of the pair (self when not a provider).
    pub fn value_link(self: &Arc<Self>) -> Arc<Link> {
        if self.is_provider {
            self.twin_link().unwrap_or_else(|| self.clone())
        } else {
            self.clone()
        }
    }

    pub fn provider_link(self: &Arc<Self>) -> Option<Arc<Link>> {
        if self.is_provider {
            Some(self.clone())
        } else {
            self.twin_link()
        }
    }

    /// The link a write lands on: the twin unless crossing is suppressed.
    pub fn holder_link(self: &Arc<Self>, use_uncrossed: bool) -> Arc<Link> {
        if !use_uncrossed {
            if let Some(twin) = self.twin_link() {
                return twin;
            }
        }
        self.clone()
    }

    pub fn twin_name(&self) -> String {
        if self.is_provider {
            self.name[..self.name.len() - 1].to_string()
        } else {
            format!("{}!", self.name)
        }
    }

    pub fn is_bidir_mode(&self) -> bool {
        self.twin_link().is_some()
    }

    // ---- thread flag --------------------------------------------------

    pub fn is_threaded(&self) -> bool {
        self.threaded.load(Ordering::Relaxed)
    }

    /// Marks this link as touched from outside the registry thread. Every
    /// ancestor becomes threaded too, as upward-propagated events cross
    /// the same thread boundary. Registry thread only.
    pub(crate) fn set_threaded(self: &Arc<Self>) {
        let mut cur = Some(self.clone());
        while let Some(link) = cur {
            if link.threaded.swap(true, Ordering::Relaxed) {
                break; // ancestors above are already flagged
            }
            cur = link.parent();
        }
    }

    // ---- modes --------------------------------------------------------

    pub fn get_mode(&self) -> ObjectMode {
        let mut mode = ObjectMode::empty();
        {
            let inner = self.inner.lock();
            mode.set(ObjectMode::PIPE, inner.is_pipe);
        }
        mode.set(ObjectMode::BIDIR, self.is_bidir_mode());
        mode.set(ObjectMode::SAVE, self.is_save_mode_raw());
        mode
    }

    pub fn is_pipe_mode(&self) -> bool {
        self.inner.lock().is_pipe
    }

    pub fn set_pipe_mode(self: &Arc<Self>, is_pipe: bool, also_set_twin: bool) {
        let changed = {
            let mut inner = self.inner.lock();
            let changed = inner.is_pipe != is_pipe;
            inner.is_pipe = is_pipe;
            changed
        };
        if changed {
            self.do_mode_changed();
        }
        if also_set_twin {
            if let Some(twin) = self.twin_link() {
                twin.set_pipe_mode(is_pipe, false);
            }
        }
    }

    fn is_save_mode_raw(&self) -> bool {
        // Save mode is always stored on the value half; a provider must
        // consult its twin without recursing through `value_link`.
        if self.is_provider {
            match self.twin_link() {
                Some(value) => value.inner.lock().is_save,
                None => false,
            }
        } else {
            self.inner.lock().is_save
        }
    }

    pub fn is_save_mode(self: &Arc<Self>) -> bool {
        self.value_link().inner.lock().is_save
    }

    pub fn set_save_mode(self: &Arc<Self>, is_save: bool) {
        let value = self.value_link();
        let changed = {
            let mut inner = value.inner.lock();
            let changed = inner.is_save != is_save;
            inner.is_save = is_save;
            changed
        };
        if changed {
            value.do_mode_changed();
        }
    }

    pub fn set_atomic_op_provider(&self, is_provider: bool) {
        self.inner.lock().is_atomic_op_provider = is_provider;
    }

    pub fn is_atomic_op_provider(&self) -> bool {
        self.inner.lock().is_atomic_op_provider
    }

    pub fn add_sync_mode(&self, sync_mode: SyncMode) {
        self.inner.lock().sync_mode |= sync_mode;
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.inner.lock().sync_mode
    }

    // ---- value --------------------------------------------------------

    pub fn data_type(&self) -> DataType {
        self.inner.lock().cell.as_ref().map(Cell::data_type).unwrap_or_default()
    }

    pub fn local_update_count(&self) -> u32 {
        self.inner.lock().cell.as_ref().map(Cell::local_update_count).unwrap_or(0)
    }

    pub fn to_int(&self) -> Option<i64> {
        self.inner.lock().cell.as_mut()?.to_int()
    }

    pub fn to_real(&self) -> Option<f64> {
        self.inner.lock().cell.as_mut()?.to_real()
    }

    pub fn to_string_val(&self) -> Option<String> {
        self.inner.lock().cell.as_mut()?.to_string_val()
    }

    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        self.inner.lock().cell.as_mut()?.to_bytes()
    }

    pub fn to_variant(&self) -> Option<Variant> {
        self.inner.lock().cell.as_mut()?.to_variant()
    }

    fn commit<F: FnOnce(&mut Cell)>(&self, f: F, meta: &WriteMeta) -> bool {
        let mut inner = self.inner.lock();
        match inner.cell.as_mut() {
            Some(cell) => {
                f(cell);
                if !meta.from_remote {
                    cell.bump_update_count();
                }
                true
            }
            None => false,
        }
    }

    fn pipe_export(&self, text: &[u8]) -> Arc<[u8]> {
        let mut data = Vec::with_capacity(text.len() + 1);
        data.push(ExportCode::String as u8);
        data.extend_from_slice(text);
        data.into()
    }

    pub fn set_int(self: &Arc<Self>, value: i64, send_id: u32, use_uncrossed: bool) {
        if !use_uncrossed {
            if let Some(twin) = self.twin_link() {
                return twin.set_int(value, send_id, true);
            }
        }
        if !self.commit(|c| c.set_int(value), &WriteMeta::null()) {
            return;
        }
        let data = self.is_pipe_mode().then(|| self.pipe_export(value.to_string().as_bytes()));
        self.do_value_changed(send_id, data, WriteMeta::null());
    }

    pub fn set_real(self: &Arc<Self>, value: f64, send_id: u32, use_uncrossed: bool) {
        if !use_uncrossed {
            if let Some(twin) = self.twin_link() {
                return twin.set_real(value, send_id, true);
            }
        }
        if !self.commit(|c| c.set_real(value), &WriteMeta::null()) {
            return;
        }
        let data = self.is_pipe_mode().then(|| self.pipe_export(format_real(value).as_bytes()));
        self.do_value_changed(send_id, data, WriteMeta::null());
    }

    pub fn set_string(self: &Arc<Self>, value: &str, send_id: u32, use_uncrossed: bool, meta: WriteMeta) {
        if !use_uncrossed {
            if let Some(twin) = self.twin_link() {
                return twin.set_string(value, send_id, true, meta);
            }
        }
        if !self.commit(|c| c.set_string(value), &meta) {
            return;
        }
        let data = (self.is_pipe_mode() || !meta.is_null()).then(|| self.pipe_export(value.as_bytes()));
        self.do_value_changed(send_id, data, meta);
    }

    pub fn set_bytes(self: &Arc<Self>, value: &[u8], send_id: u32, use_uncrossed: bool, meta: WriteMeta) {
        if !use_uncrossed {
            if let Some(twin) = self.twin_link() {
                return twin.set_bytes(value, send_id, true, meta);
            }
        }
        if !self.commit(|c| c.set_bytes(value), &meta) {
            return;
        }
        let data = (self.is_pipe_mode() || !meta.is_null()).then(|| {
            let mut d = Vec::with_capacity(value.len() + 1);
            d.push(ExportCode::ByteArray as u8);
            d.extend_from_slice(value);
            Arc::from(d.into_boxed_slice())
        });
        self.do_value_changed(send_id, data, meta);
    }

    pub fn set_variant(self: &Arc<Self>, value: Variant, send_id: u32, use_uncrossed: bool, meta: WriteMeta) {
        if !use_uncrossed {
            if let Some(twin) = self.twin_link() {
                return twin.set_variant(value, send_id, true, meta);
            }
        }
        // In a pipe only variants with a text rendering are exportable.
        let text = value.as_text().map(str::to_string);
        if !self.commit(|c| c.set_variant(value), &meta) {
            return;
        }
        let data = self
            .is_pipe_mode()
            .then(|| self.pipe_export(text.unwrap_or_default().as_bytes()));
        self.do_value_changed(send_id, data, meta);
    }

    /// A write whose value equals the current one and was skipped. Still
    /// counts as a local update so sync sees the touch.
    pub fn set_ignored_value(&self, meta: &WriteMeta) {
        let mut inner = self.inner.lock();
        if let Some(cell) = inner.cell.as_mut() {
            if !meta.from_remote {
                cell.bump_update_count();
            }
        }
    }

    // ---- atomic operations --------------------------------------------

    pub fn set_bits(self: &Arc<Self>, mask: i64, value: i64, send_id: u32, use_uncrossed: bool) {
        if let Some(twin) = self.twin_link() {
            if !self.is_atomic_op_provider() {
                if twin.is_atomic_op_provider() {
                    // Exactly one of the pair executes; route to that half.
                    return twin.set_bits(mask, value, send_id, use_uncrossed);
                }
                // No provider in the pair: apply here, and tell peers so a
                // remote op provider can execute it as well.
                twin.send_event(&LinkEvent::AtomicOp { op: AtomicOp::BitSet { mask, value } });
            }
            // This half is the op provider: execute here.
        }

        let new_value = {
            let mut inner = self.inner.lock();
            let cell = match inner.cell.as_mut() {
                Some(c) => c,
                None => return,
            };
            let old = cell.to_int().unwrap_or(0);
            let new_value = (old & !mask) | (value & mask);
            cell.set_int(new_value);
            cell.bump_update_count();
            new_value
        };

        if !use_uncrossed {
            if let Some(twin) = self.twin_link() {
                twin.set_int(new_value, send_id, true);
            }
        }

        let data = self.is_pipe_mode().then(|| self.pipe_export(new_value.to_string().as_bytes()));
        self.do_value_changed(send_id, data, WriteMeta::null());
    }

    pub fn add_int(self: &Arc<Self>, value: i64, send_id: u32, use_uncrossed: bool) {
        if let Some(twin) = self.twin_link() {
            if !self.is_atomic_op_provider() {
                if twin.is_atomic_op_provider() {
                    return twin.add_int(value, send_id, use_uncrossed);
                }
                twin.send_event(&LinkEvent::AtomicOp { op: AtomicOp::AddInt(value) });
            }
        }

        let new_value = {
            let mut inner = self.inner.lock();
            let cell = match inner.cell.as_mut() {
                Some(c) => c,
                None => return,
            };
            let new_value = cell.to_int().unwrap_or(0).wrapping_add(value);
            cell.set_int(new_value);
            cell.bump_update_count();
            new_value
        };

        if !use_uncrossed {
            if let Some(twin) = self.twin_link() {
                twin.set_int(new_value, send_id, true);
            }
        }

        let data = self.is_pipe_mode().then(|| self.pipe_export(new_value.to_string().as_bytes()));
        self.do_value_changed(send_id, data, WriteMeta::null());
    }

    pub fn add_real(self: &Arc<Self>, value: f64, send_id: u32, use_uncrossed: bool) {
        if let Some(twin) = self.twin_link() {
            if !self.is_atomic_op_provider() {
                if twin.is_atomic_op_provider() {
                    return twin.add_real(value, send_id, use_uncrossed);
                }
                twin.send_event(&LinkEvent::AtomicOp { op: AtomicOp::AddReal(value) });
            }
        }

        let new_value = {
            let mut inner = self.inner.lock();
            let cell = match inner.cell.as_mut() {
                Some(c) => c,
                None => return,
            };
            let new_value = cell.to_real().unwrap_or(0.0) + value;
            cell.set_real(new_value);
            cell.bump_update_count();
            new_value
        };

        if !use_uncrossed {
            if let Some(twin) = self.twin_link() {
                twin.set_real(new_value, send_id, true);
            }
        }

        let data = self.is_pipe_mode().then(|| self.pipe_export(format_real(new_value).as_bytes()));
        self.do_value_changed(send_id, data, WriteMeta::null());
    }

    // ---- subscription & events ----------------------------------------

    pub(crate) fn subscribe(&self, core: &Arc<HandleCore>) {
        let mut inner = self.inner.lock();
        inner.subscribers.push(Subscriber { handle_id: core.id(), target: Arc::downgrade(core) });
    }

    pub(crate) fn unsubscribe(&self, handle_id: u32) -> bool {
        let mut inner = self.inner.lock();
        match inner.subscribers.iter().position(|s| s.handle_id == handle_id) {
            Some(pos) => {
                inner.subscribers.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Delivers `ev` to every subscriber of this link. A snapshot of the
    /// subscriber list is taken so handles may close during delivery; on
    /// a threaded link each subscriber's thread affinity decides between
    /// inline and queued delivery.
    pub fn send_event(&self, ev: &LinkEvent) {
        let threaded = self.is_threaded();
        let snapshot: Vec<(u32, Weak<HandleCore>)> = {
            let inner = self.inner.lock();
            inner.subscribers.iter().map(|s| (s.handle_id, s.target.clone())).collect()
        };
        for (_, target) in snapshot {
            if let Some(core) = target.upgrade() {
                core.deliver(ev, threaded);
            }
        }
    }

    /// Delivers `ev` to `start` and every ancestor up to the root.
    pub fn send_event_dir_root(start: &Arc<Link>, ev: &LinkEvent) {
        let mut cur = Some(start.clone());
        while let Some(link) = cur {
            link.send_event(ev);
            cur = link.parent();
        }
    }

    fn do_value_changed(&self, send_id: u32, value_data: Option<Arc<[u8]>>, meta: WriteMeta) {
        self.send_event(&LinkEvent::ValueChanged { send_id, value_data, meta });
    }

    pub(crate) fn do_mode_changed(self: &Arc<Self>) {
        let ev = LinkEvent::ModeChanged { path: self.path(), link_id: self.id, mode: self.get_mode() };
        Link::send_event_dir_root(self, &ev);
    }

    /// Completes a lookup step: first time through, records the sync mode
    /// and announces the link to its ancestors.
    pub(crate) fn setup_end(self: &Arc<Self>, path: &str, sync_mode: SyncMode, flags: LinkFlags) {
        let first = {
            let mut inner = self.inner.lock();
            let first = !inner.has_been_setup;
            inner.has_been_setup = true;
            if first {
                inner.sync_mode |= sync_mode;
            }
            first
        };
        if first {
            if let Some(parent) = self.parent() {
                let ev = LinkEvent::LinkCreated {
                    path: path.to_string(),
                    link: self.clone(),
                    is_last: flags.contains(LinkFlags::LAST_LINK),
                };
                Link::send_event_dir_root(&parent, &ev);
            }
        }
    }

    // ---- retirement ---------------------------------------------------

    pub fn is_retired(&self) -> bool {
        self.inner.lock().is_retired
    }

    pub fn retire_kind(&self) -> RetireKind {
        self.inner.lock().retired
    }

    pub(crate) fn set_retired(&self, kind: RetireKind) {
        let mut inner = self.inner.lock();
        inner.retired = kind;
        inner.is_retired = true;
    }

    pub(crate) fn do_retired(self: &Arc<Self>, start: &Arc<Link>, is_global: bool) {
        if Arc::ptr_eq(self, start) {
            if let Some(parent) = self.parent() {
                let ev = LinkEvent::Retired { start: start.clone(), is_below: true, is_global };
                Link::send_event_dir_root(&parent, &ev);
            }
        }
        self.send_event(&LinkEvent::Retired { start: start.clone(), is_below: false, is_global });
    }

    // ---- handle refcount ----------------------------------------------

    /// Adds one handle reference. Registry thread only.
    pub(crate) fn ref_inc(self: &Arc<Self>) {
        let value = self.value_link();
        let mut inner = value.inner.lock();
        if inner.ref_count <= 0 {
            inner.ref_count = 1;
        } else {
            inner.ref_count += 1;
        }
    }

    /// Drops one handle reference. The last drop schedules a zero-ref
    /// check on the registry thread.
    pub(crate) fn ref_dec(self: &Arc<Self>) {
        let value = self.value_link();
        let is_zero = {
            let mut inner = value.inner.lock();
            if inner.ref_count > 1 {
                inner.ref_count -= 1;
                false
            } else {
                inner.ref_count = 0;
                inner.zero_ref_count += 1;
                true
            }
        };
        if is_zero {
            self.hook.post_zero_ref(self.clone());
        }
    }

    pub fn ref_count(self: &Arc<Self>) -> i32 {
        self.value_link().inner.lock().ref_count
    }

    pub(crate) fn set_ref_count(self: &Arc<Self>, count: i32) {
        self.value_link().inner.lock().ref_count = count;
    }

    pub(crate) fn dec_zero_refs(self: &Arc<Self>) {
        let value = self.value_link();
        let mut inner = value.inner.lock();
        if inner.zero_ref_count > 0 {
            inner.zero_ref_count -= 1;
        }
    }

    pub(crate) fn is_last_zero_ref(self: &Arc<Self>) -> bool {
        let value = self.value_link();
        let inner = value.inner.lock();
        inner.ref_count == 0 && inner.zero_ref_count == 0
    }

    pub(crate) fn hook(&self) -> &RegistryHook {
        &self.hook
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("is_folder", &self.is_folder)
            .finish()
    }
}
