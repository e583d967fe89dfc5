//! Typed accessors onto tree links.
//!
//! A [`Handle`] references one link, carries per-handle state (echo
//! blocking, ignore-same-value, uncrossed access) and receives link events
//! either directly on the mutating thread or through a queued intake. The
//! byte-level import/export codec used by the sync layer and the persist
//! store also lives here.

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use parking_lot::{Mutex, RwLock};

use crate::error::ErrCode;
use crate::event::{Delivery, EventIntake, LinkEvent, QueuedEvent, WriteMeta};
use crate::link::Link;
use crate::mode::{LinkFlags, ObjectMode, RetireKind, SyncMode};
use crate::registry::Registry;
use crate::value::{DataType, Variant, VariantRepr};

static HANDLE_ID: AtomicU32 = AtomicU32::new(1);

/// First byte of an exported value when it is below ASCII 32. Printable
/// data never starts with one of these, so plain text travels unframed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ExportCode {
    /// Legacy binary variant stream. Not produced nor accepted here.
    Variant = 1,
    /// Type name, `:`, utf-8 text.
    VariantTxt = 2,
    /// Version byte, type name, `:`, raw bytes.
    VariantBin = 3,
    ByteArray = 4,
    String = 5,
}

const VARIANT_BIN_VER: u8 = 1;

type EventCallback = Arc<dyn Fn(&LinkEvent) + Send + Sync>;

/// Shared state of one handle; the unit links subscribe to and events
/// target.
pub struct HandleCore {
    id: u32,
    registry: Registry,
    link: RwLock<Option<Arc<Link>>>,
    closed: AtomicBool,
    block_echo: AtomicBool,
    ignore_same: AtomicBool,
    use_uncrossed: AtomicBool,
    only_echo: AtomicBool,
    /// The thread this handle belongs to (the one that opened it); direct
    /// callbacks only run there.
    owner_thread: Mutex<ThreadId>,
    /// The callback may run on whatever thread committed the mutation.
    any_thread: AtomicBool,
    mode_cache: Mutex<ObjectMode>,
    sync_mode: Mutex<SyncMode>,
    sync_mode_link_share: AtomicBool,
    delivery: Mutex<Delivery>,
    intake: Mutex<Option<Arc<EventIntake>>>,
    callback: Mutex<Option<EventCallback>>,
}

impl HandleCore {
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn link(&self) -> Option<Arc<Link>> {
        self.link.read().clone()
    }

    /// Event entry point, called from whatever thread committed the
    /// mutation. `threaded` is the thread flag of the dispatching link.
    ///
    /// On a threaded link a subscriber owned by another thread gets its
    /// internal state adjusted here (that part is atomic), while the user
    /// callback is parked on the handle's own intake for the owner to
    /// take with [`Handle::poll_events`] - unless the handle declared its
    /// callback safe for any thread.
    pub(crate) fn deliver(self: &Arc<Self>, ev: &LinkEvent, threaded: bool) {
        if self.is_closed() {
            return;
        }
        let delivery = self.delivery.lock().clone();
        match delivery {
            Delivery::Queue(intake) => {
                intake.push(QueuedEvent { target: Arc::downgrade(self), event: ev.clone() });
            }
            Delivery::Direct => {
                if !self.apply_default_policy(ev) {
                    return;
                }
                let same_thread =
                    !threaded || thread::current().id() == *self.owner_thread.lock();
                if same_thread || self.any_thread.load(Ordering::Relaxed) {
                    let cb = self.callback.lock().clone();
                    if let Some(cb) = cb {
                        cb(ev);
                    }
                } else if self.callback.lock().is_some() {
                    self.own_intake()
                        .push(QueuedEvent { target: Arc::downgrade(self), event: ev.clone() });
                }
            }
        }
    }

    /// The default per-handle event policy. Returns false when the event
    /// is consumed (suppressed echo).
    pub(crate) fn apply_default_policy(&self, ev: &LinkEvent) -> bool {
        match ev {
            LinkEvent::ValueChanged { send_id, .. } => {
                if self.block_echo.load(Ordering::Relaxed) && *send_id == self.id {
                    return false;
                }
                if *send_id != self.id {
                    self.only_echo.store(false, Ordering::Relaxed);
                }
                true
            }
            LinkEvent::ModeChanged { mode, .. } => {
                if mode.contains(ObjectMode::PIPE) {
                    // Pipe mode never deduplicates.
                    self.ignore_same.store(false, Ordering::Relaxed);
                }
                true
            }
            LinkEvent::Retired { is_below, .. } => {
                if !is_below {
                    self.close();
                }
                true
            }
            _ => true,
        }
    }

    /// The handle's event intake, created on first need.
    fn own_intake(&self) -> Arc<EventIntake> {
        let mut slot = self.intake.lock();
        if let Some(intake) = slot.as_ref() {
            return intake.clone();
        }
        let intake = EventIntake::new();
        *slot = Some(intake.clone());
        intake
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let link = self.link.write().take();
        if let Some(link) = link {
            link.unsubscribe(self.id);
            link.hook().count_ref(-1);
            link.ref_dec();
        }
        *self.mode_cache.lock() = ObjectMode::empty();
        *self.sync_mode.lock() = SyncMode::empty();
    }
}

/// A user-facing accessor for one link. Closes itself on drop.
pub struct Handle {
    core: Arc<HandleCore>,
}

impl Handle {
    pub fn new(registry: &Registry) -> Handle {
        let core = Arc::new(HandleCore {
            id: HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            registry: registry.clone(),
            link: RwLock::new(None),
            closed: AtomicBool::new(false),
            block_echo: AtomicBool::new(false),
            ignore_same: AtomicBool::new(registry.default_ignore_same_value()),
            use_uncrossed: AtomicBool::new(false),
            only_echo: AtomicBool::new(true),
            owner_thread: Mutex::new(thread::current().id()),
            any_thread: AtomicBool::new(false),
            mode_cache: Mutex::new(ObjectMode::empty()),
            sync_mode: Mutex::new(SyncMode::empty()),
            sync_mode_link_share: AtomicBool::new(true),
            delivery: Mutex::new(Delivery::Direct),
            intake: Mutex::new(None),
            callback: Mutex::new(None),
        });
        Handle { core }
    }

    /// Opens with create-if-missing, the common case.
    pub fn open(registry: &Registry, path: &str) -> crate::error::Result<Handle> {
        let handle = Handle::new(registry);
        handle.open_with_flags(path, LinkFlags::CREATE_ALLOWED)?;
        Ok(handle)
    }

    pub fn open_folder(registry: &Registry, path: &str) -> crate::error::Result<Handle> {
        let handle = Handle::new(registry);
        handle.open_with_flags(path, LinkFlags::CREATE_ALLOWED | LinkFlags::FOLDER)?;
        Ok(handle)
    }

    pub fn open_with_flags(&self, path: &str, flags: LinkFlags) -> crate::error::Result<()> {
        if self.core.link().is_some() {
            self.core.close();
        }
        let sync_mode = self.open_sync_mode();
        let link = self.core.registry.open_link(path, flags, sync_mode)?;
        self.finish_open(link, flags);
        Ok(())
    }

    /// Async open for session tasks; never blocks a runtime worker.
    pub async fn open_with_flags_async(&self, path: &str, flags: LinkFlags) -> crate::error::Result<()> {
        if self.core.link().is_some() {
            self.core.close();
        }
        let sync_mode = self.open_sync_mode();
        let link = self.core.registry.open_link_async(path, flags, sync_mode).await?;
        self.finish_open(link, flags);
        Ok(())
    }

    fn open_sync_mode(&self) -> SyncMode {
        if self.core.sync_mode_link_share.load(Ordering::Relaxed) {
            *self.core.sync_mode.lock()
        } else {
            SyncMode::empty()
        }
    }

    fn finish_open(&self, link: Arc<Link>, flags: LinkFlags) {
        self.core.closed.store(false, Ordering::Release);
        *self.core.owner_thread.lock() = thread::current().id();
        link.hook().count_ref(1);
        link.subscribe(&self.core);
        *self.core.link.write() = Some(link.clone());

        if flags.contains(LinkFlags::THREADED) && self.core.intake.lock().is_none() {
            // Opened for use off the registry thread: queue events so no
            // callback runs on a foreign thread.
            self.events();
        }

        let mode = *self.core.mode_cache.lock();
        if !mode.is_empty() {
            self.add_mode(mode);
        }
    }

    pub fn close(&self) {
        self.core.close();
    }

    pub fn is_open(&self) -> bool {
        self.core.link().is_some()
    }

    /// Retires the link tree behind this handle.
    pub fn destroy(&self, is_global: bool) {
        if let Some(link) = self.core.link() {
            self.core.registry.destroy_link(&link, is_global);
        }
    }

    pub(crate) fn core(&self) -> &Arc<HandleCore> {
        &self.core
    }

    pub fn registry(&self) -> &Registry {
        &self.core.registry
    }

    // ---- identity -----------------------------------------------------

    /// The unique id of this handle, used as value-change sender id.
    pub fn id(&self) -> u32 {
        self.core.id
    }

    pub fn link_id(&self) -> u32 {
        self.core.link().map(|l| l.id()).unwrap_or(0)
    }

    pub fn path(&self) -> String {
        self.core.link().map(|l| l.path()).unwrap_or_default()
    }

    pub fn name(&self) -> String {
        self.core
            .link()
            .map(|l| l.link_name(crate::path::NameFormat::DEFAULT))
            .unwrap_or_default()
    }

    pub fn is_folder(&self) -> bool {
        self.core.link().map(|l| l.is_folder()).unwrap_or(false)
    }

    pub fn is_provider(&self) -> bool {
        self.core.link().map(|l| l.is_provider()).unwrap_or(false)
    }

    pub fn data_type(&self) -> DataType {
        self.core.link().map(|l| l.data_type()).unwrap_or_default()
    }

    pub fn ref_count(&self) -> i32 {
        self.core.link().map(|l| l.ref_count().max(0)).unwrap_or(-1)
    }

    pub fn local_update_count(&self) -> u32 {
        self.core.link().map(|l| l.local_update_count()).unwrap_or(0)
    }

    pub fn retire_kind(&self) -> RetireKind {
        self.core.link().map(|l| l.retire_kind()).unwrap_or(RetireKind::None)
    }

    // ---- per-handle flags ---------------------------------------------

    pub fn set_block_echo(&self, block: bool) {
        self.core.block_echo.store(block, Ordering::Relaxed);
    }

    pub fn set_ignore_same_value(&self, is_ignore: bool) {
        let effective = if self.is_pipe_mode() { false } else { is_ignore };
        self.core.ignore_same.store(effective, Ordering::Relaxed);
    }

    pub fn is_ignore_same_value(&self) -> bool {
        self.core.ignore_same.load(Ordering::Relaxed)
    }

    /// Read/write the near half of a bidirectional pair instead of
    /// crossing to the twin.
    pub fn set_uncrossed(&self, uncrossed: bool) {
        self.core.use_uncrossed.store(uncrossed, Ordering::Relaxed);
    }

    pub fn is_uncrossed(&self) -> bool {
        self.core.use_uncrossed.load(Ordering::Relaxed) || !self.is_bidir_mode()
    }

    pub(crate) fn is_only_echo(&self) -> bool {
        self.core.only_echo.load(Ordering::Relaxed)
    }

    pub(crate) fn reset_only_echo(&self) {
        self.core.only_echo.store(true, Ordering::Relaxed);
    }

    pub(crate) fn add_is_only_echo(&self, send_id: u32) {
        if send_id != self.core.id {
            self.core.only_echo.store(false, Ordering::Relaxed);
        }
    }

    // ---- modes --------------------------------------------------------

    pub fn set_bidir_mode(&self) {
        *self.core.mode_cache.lock() |= ObjectMode::BIDIR;
        let Some(link) = self.core.link() else { return };
        if link.is_bidir_mode() {
            return;
        }
        match self.core.registry.add_twin(&link, self.sync_mode(), LinkFlags::empty()) {
            Ok(twin) => twin.ref_dec(),
            Err(err) => self.error_log(&err.msg, err.code),
        }
    }

    pub fn is_bidir_mode(&self) -> bool {
        match self.core.link() {
            Some(link) => link.is_bidir_mode(),
            None => self.core.mode_cache.lock().contains(ObjectMode::BIDIR),
        }
    }

    pub fn set_pipe_mode(&self) {
        *self.core.mode_cache.lock() |= ObjectMode::PIPE | ObjectMode::BIDIR;
        self.core.ignore_same.store(false, Ordering::Relaxed);
        let Some(link) = self.core.link() else { return };
        if link.is_pipe_mode() {
            return;
        }
        match self.core.registry.add_twin(&link, self.sync_mode(), LinkFlags::empty()) {
            Ok(twin) => {
                link.set_pipe_mode(true, true);
                twin.ref_dec();
            }
            Err(err) => self.error_log(&err.msg, err.code),
        }
    }

    pub fn is_pipe_mode(&self) -> bool {
        match self.core.link() {
            Some(link) => link.is_pipe_mode(),
            None => self.core.mode_cache.lock().contains(ObjectMode::PIPE),
        }
    }

    pub fn set_save_mode(&self) {
        *self.core.mode_cache.lock() |= ObjectMode::SAVE;
        if let Some(link) = self.core.link() {
            link.set_save_mode(true);
        }
    }

    pub fn is_save_mode(&self) -> bool {
        match self.core.link() {
            Some(link) => link.is_save_mode(),
            None => self.core.mode_cache.lock().contains(ObjectMode::SAVE),
        }
    }

    pub fn add_mode(&self, mode: ObjectMode) {
        *self.core.mode_cache.lock() |= mode;
        if mode.contains(ObjectMode::PIPE) {
            self.set_pipe_mode();
        } else if mode.contains(ObjectMode::BIDIR) {
            self.set_bidir_mode();
        }
        if mode.contains(ObjectMode::SAVE) {
            self.set_save_mode();
        }
    }

    pub fn get_mode(&self) -> ObjectMode {
        match self.core.link() {
            Some(link) => link.get_mode(),
            None => *self.core.mode_cache.lock(),
        }
    }

    pub fn set_atomic_op_provider(&self) {
        if let Some(link) = self.core.link() {
            link.set_atomic_op_provider(true);
        }
    }

    pub fn is_atomic_op_provider(&self) -> bool {
        self.core.link().map(|l| l.is_atomic_op_provider()).unwrap_or(false)
    }

    // ---- sync modes ---------------------------------------------------

    /// Makes this end the value originator on first session contact.
    /// Must be set before open; a late call is rejected.
    pub fn set_master(&self) {
        if self.is_open() {
            return self.error_log("Setting item/link as master", ErrCode::AlreadyOpen);
        }
        self.add_sync_mode(SyncMode::MASTER, true);
    }

    pub fn is_master(&self) -> bool {
        self.sync_mode().contains(SyncMode::MASTER)
    }

    /// Deletes the object when the creating session drops. Must be set
    /// before open; a late call is rejected.
    pub fn set_auto_destroy(&self) {
        if self.is_open() {
            return self.error_log("Setting item/link to autoDestroy", ErrCode::AlreadyOpen);
        }
        self.add_sync_mode(SyncMode::AUTO_DESTROY, true);
    }

    pub fn is_auto_destroy(&self) -> bool {
        self.sync_mode().contains(SyncMode::AUTO_DESTROY)
    }

    pub fn add_sync_mode(&self, sync_mode: SyncMode, link_share: bool) {
        self.core.sync_mode_link_share.store(link_share, Ordering::Relaxed);
        *self.core.sync_mode.lock() |= sync_mode;
        if link_share {
            if let Some(link) = self.core.link() {
                link.add_sync_mode(*self.core.sync_mode.lock());
            }
        }
    }

    pub fn sync_mode(&self) -> SyncMode {
        if self.core.sync_mode_link_share.load(Ordering::Relaxed) {
            if let Some(link) = self.core.link() {
                return link.sync_mode();
            }
        }
        *self.core.sync_mode.lock()
    }

    // ---- typed reads --------------------------------------------------

    pub fn to_int(&self) -> Option<i64> {
        self.core.link()?.to_int()
    }

    pub fn to_real(&self) -> Option<f64> {
        self.core.link()?.to_real()
    }

    pub fn to_bool(&self) -> Option<bool> {
        self.to_int().map(|v| v != 0)
    }

    pub fn to_string_val(&self) -> Option<String> {
        self.core.link()?.to_string_val()
    }

    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        self.core.link()?.to_bytes()
    }

    pub fn to_variant(&self) -> Option<Variant> {
        self.core.link()?.to_variant()
    }

    // ---- typed writes -------------------------------------------------

    pub fn set_int(&self, value: i64) {
        self.set_int_opt(value, None);
    }

    pub(crate) fn set_int_opt(&self, value: i64, ignore_same: Option<bool>) {
        let Some(link) = self.core.link() else {
            return self.error_log(&format!("Assigning int: {}", value), ErrCode::ItemNotOpen);
        };
        if ignore_same.unwrap_or_else(|| self.is_ignore_same_value()) {
            let holder = link.holder_link(self.core.use_uncrossed.load(Ordering::Relaxed));
            if holder.to_int() == Some(value) {
                holder.set_ignored_value(&WriteMeta::null());
                return;
            }
        }
        link.set_int(value, self.core.id, self.core.use_uncrossed.load(Ordering::Relaxed));
    }

    pub fn set_real(&self, value: f64) {
        self.set_real_opt(value, None);
    }

    pub(crate) fn set_real_opt(&self, value: f64, ignore_same: Option<bool>) {
        let Some(link) = self.core.link() else {
            return self.error_log(&format!("Assigning real: {}", value), ErrCode::ItemNotOpen);
        };
        if ignore_same.unwrap_or_else(|| self.is_ignore_same_value()) {
            let holder = link.holder_link(self.core.use_uncrossed.load(Ordering::Relaxed));
            if holder.to_real() == Some(value) {
                holder.set_ignored_value(&WriteMeta::null());
                return;
            }
        }
        link.set_real(value, self.core.id, self.core.use_uncrossed.load(Ordering::Relaxed));
    }

    pub fn set_bool(&self, value: bool) {
        self.set_int(value as i64);
    }

    pub fn set_string(&self, value: &str) {
        self.set_string_opt(value, None, WriteMeta::null());
    }

    pub(crate) fn set_string_opt(&self, value: &str, ignore_same: Option<bool>, meta: WriteMeta) {
        let Some(link) = self.core.link() else {
            return self.error_log(&format!("Assigning string: {}", value), ErrCode::ItemNotOpen);
        };
        if ignore_same.unwrap_or_else(|| self.is_ignore_same_value()) {
            let holder = link.holder_link(self.core.use_uncrossed.load(Ordering::Relaxed));
            if holder.to_string_val().as_deref() == Some(value) {
                holder.set_ignored_value(&meta);
                return;
            }
        }
        link.set_string(value, self.core.id, self.core.use_uncrossed.load(Ordering::Relaxed), meta);
    }

    pub fn set_bytes(&self, value: &[u8]) {
        self.set_bytes_opt(value, None, WriteMeta::null());
    }

    pub(crate) fn set_bytes_opt(&self, value: &[u8], ignore_same: Option<bool>, mut meta: WriteMeta) {
        let Some(link) = self.core.link() else {
            return self.error_log("Assigning bytearray", ErrCode::ItemNotOpen);
        };
        let use_uncrossed = self.core.use_uncrossed.load(Ordering::Relaxed);

        if meta.text {
            let text = String::from_utf8_lossy(value).into_owned();
            if ignore_same.unwrap_or_else(|| self.is_ignore_same_value()) {
                let holder = link.holder_link(use_uncrossed);
                if holder.to_string_val().as_deref() == Some(text.as_str()) {
                    holder.set_ignored_value(&meta);
                    return;
                }
            }
            meta.text = false; // consumed here
            link.set_string(&text, self.core.id, use_uncrossed, meta);
        } else {
            if ignore_same.unwrap_or_else(|| self.is_ignore_same_value()) {
                let holder = link.holder_link(use_uncrossed);
                if holder.to_bytes().as_deref() == Some(value) {
                    holder.set_ignored_value(&meta);
                    return;
                }
            }
            link.set_bytes(value, self.core.id, use_uncrossed, meta);
        }
    }

    pub fn set_variant(&self, value: Variant) {
        self.set_variant_opt(value, None, WriteMeta::null());
    }

    /// Pipe write that may overwrite a pending, not yet transmitted write
    /// whose payload matches `pattern` (see the sync session's queue
    /// coalescing).
    pub fn set_string_overwrite(&self, value: &str, pattern: &str) {
        let meta = WriteMeta { queue_find_regexp: Some(pattern.to_string()), ..Default::default() };
        self.set_string_opt(value, Some(false), meta);
    }

    pub(crate) fn set_variant_opt(&self, value: Variant, ignore_same: Option<bool>, meta: WriteMeta) {
        let Some(link) = self.core.link() else {
            return self.error_log("Assigning variant", ErrCode::ItemNotOpen);
        };
        if ignore_same.unwrap_or_else(|| self.is_ignore_same_value()) {
            let holder = link.holder_link(self.core.use_uncrossed.load(Ordering::Relaxed));
            if holder.to_variant().as_ref() == Some(&value) {
                holder.set_ignored_value(&meta);
                return;
            }
        }
        link.set_variant(value, self.core.id, self.core.use_uncrossed.load(Ordering::Relaxed), meta);
    }

    // ---- atomic operations --------------------------------------------

    pub fn set_bits(&self, mask: i64, value: i64) {
        let Some(link) = self.core.link() else {
            return self.error_log("Op setBits", ErrCode::ItemNotOpen);
        };
        if self.is_ignore_same_value() {
            let holder = link.holder_link(self.core.use_uncrossed.load(Ordering::Relaxed));
            if let Some(old) = holder.to_int() {
                if (old & !mask) | (value & mask) == old {
                    holder.set_ignored_value(&WriteMeta::null());
                    return;
                }
            }
        }
        link.set_bits(mask, value, self.core.id, self.core.use_uncrossed.load(Ordering::Relaxed));
    }

    pub fn add_value(&self, value: i64) {
        let Some(link) = self.core.link() else {
            return self.error_log("Op addValue<int>", ErrCode::ItemNotOpen);
        };
        link.add_int(value, self.core.id, self.core.use_uncrossed.load(Ordering::Relaxed));
    }

    pub fn add_value_real(&self, value: f64) {
        let Some(link) = self.core.link() else {
            return self.error_log("Op addValue<real>", ErrCode::ItemNotOpen);
        };
        link.add_real(value, self.core.id, self.core.use_uncrossed.load(Ordering::Relaxed));
    }

    // ---- import / export ----------------------------------------------

    /// Applies an exported byte blob through the matching typed setter.
    pub fn import(&self, data: &[u8], ignore_same: Option<bool>, mut meta: WriteMeta) {
        if let Some(&first) = data.first() {
            if first < 32 {
                match ExportCode::from_u8(first) {
                    Some(ExportCode::Variant) => {
                        self.error_log("Import legacy variant stream", ErrCode::Undef);
                    }
                    Some(ExportCode::VariantTxt) => {
                        let body = &data[1..];
                        let Some(sep) = body.iter().position(|&b| b == b':') else {
                            return self.error_log("Import variant without type", ErrCode::Undef);
                        };
                        let type_name = String::from_utf8_lossy(&body[..sep]).into_owned();
                        let text = String::from_utf8_lossy(&body[sep + 1..]).into_owned();
                        self.set_variant_opt(Variant::text(type_name, text), ignore_same, meta);
                    }
                    Some(ExportCode::VariantBin) => {
                        if data.len() < 4 || data[2] != VARIANT_BIN_VER {
                            return self.error_log("Import wrong variant version", ErrCode::Undef);
                        }
                        let body = &data[3..];
                        let Some(sep) = body.iter().position(|&b| b == b':') else {
                            return self.error_log("Import variant without type", ErrCode::Undef);
                        };
                        let type_name = String::from_utf8_lossy(&body[..sep]).into_owned();
                        let raw = body[sep + 1..].to_vec();
                        self.set_variant_opt(Variant::bin(type_name, raw), ignore_same, meta);
                    }
                    Some(ExportCode::ByteArray) => {
                        self.set_bytes_opt(&data[1..], ignore_same, meta);
                    }
                    Some(ExportCode::String) => {
                        meta.text = true;
                        self.set_bytes_opt(&data[1..], ignore_same, meta);
                    }
                    None => {} // not a supported code
                }
                return;
            }
        }
        // Normal printable data.
        meta.text = true;
        self.set_bytes_opt(data, ignore_same, meta);
    }

    /// Exports the current value with its discriminator tag.
    pub fn export(&self) -> Vec<u8> {
        let Some(link) = self.core.link() else { return Vec::new() };

        match link.data_type() {
            DataType::Variant => {
                let Some(variant) = link.to_variant() else { return Vec::new() };
                let mut ret = Vec::new();
                match &variant.repr {
                    VariantRepr::Text(text) => {
                        ret.push(ExportCode::VariantTxt as u8);
                        ret.extend_from_slice(variant.type_name.as_bytes());
                        ret.push(b':');
                        ret.extend_from_slice(text.as_bytes());
                    }
                    VariantRepr::Bin(raw) => {
                        ret.push(ExportCode::VariantBin as u8);
                        ret.push(0); // spare
                        ret.push(VARIANT_BIN_VER);
                        ret.extend_from_slice(variant.type_name.as_bytes());
                        ret.push(b':');
                        ret.extend_from_slice(raw);
                    }
                }
                ret
            }
            DataType::Bytes => {
                let mut ret = vec![ExportCode::ByteArray as u8];
                ret.extend_from_slice(&link.to_bytes().unwrap_or_default());
                ret
            }
            _ => {
                let mut ret = link.to_string_val().unwrap_or_default().into_bytes();
                if ret.first().is_some_and(|&b| b < 32) {
                    // Starting char conflicts with an export code.
                    ret.insert(0, ExportCode::String as u8);
                }
                ret
            }
        }
    }

    // ---- events -------------------------------------------------------

    /// Installs a direct callback. It runs inline only for mutations
    /// committed on this handle's owner thread (or while the link is not
    /// threaded); events from other threads are parked for
    /// [`Handle::poll_events`].
    pub fn set_on_event(&self, cb: EventCallback) {
        *self.core.callback.lock() = Some(cb);
    }

    /// Installs a callback that may run on whatever thread committed the
    /// mutation. The callback is `Send + Sync`, so this is sound; use it
    /// for handles that have no thread of their own to poll from.
    pub fn set_on_event_any_thread(&self, cb: EventCallback) {
        *self.core.callback.lock() = Some(cb);
        self.core.any_thread.store(true, Ordering::Relaxed);
    }

    /// Switches to queued delivery and returns the intake. Events are then
    /// taken with [`Handle::poll_events`] (or drained by a session task).
    pub fn events(&self) -> Arc<EventIntake> {
        let mut intake_slot = self.core.intake.lock();
        if let Some(intake) = intake_slot.as_ref() {
            return intake.clone();
        }
        let intake = EventIntake::new();
        *intake_slot = Some(intake.clone());
        *self.core.delivery.lock() = Delivery::Queue(intake.clone());
        intake
    }

    /// Routes this handle's events into an externally owned intake
    /// (used by sync sessions).
    pub(crate) fn set_queue_delivery(&self, intake: Arc<EventIntake>) {
        *self.core.delivery.lock() = Delivery::Queue(intake);
    }

    /// Drains queued events, applying the default policy and invoking the
    /// callback for each. Returns the number of events processed.
    pub fn poll_events(&self) -> usize {
        let Some(intake) = self.core.intake.lock().clone() else { return 0 };
        let mut n = 0;
        while let Some((core, ev)) = intake.pop() {
            if core.apply_default_policy(&ev) {
                let cb = core.callback.lock().clone();
                if let Some(cb) = cb {
                    cb(&ev);
                }
            }
            n += 1;
        }
        n
    }

    // ---- misc ---------------------------------------------------------

    pub fn child_items(&self) -> Vec<String> {
        self.core.registry.items(&self.path())
    }

    pub(crate) fn error_log(&self, text: &str, code: ErrCode) {
        let item = match self.core.link() {
            Some(link) => format!("{} Item: {}", text, link.path()),
            None => text.to_string(),
        };
        self.core.registry.log_error(&item, code);
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.core.close();
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").field("id", &self.core.id).field("path", &self.path()).finish()
    }
}
