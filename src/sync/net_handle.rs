//! Per-session state of one synchronized handle.
//!
//! A `NetHandle` wraps a [`Handle`] with the bookkeeping a session needs:
//! the wire id, dirty flags, the rotating echo sequence, the transient
//! ini-master/ini-slave bias and the sync-mode wire strings. It is owned
//! and mutated by its session task only; events reach it through the
//! session's queued intake.

use crate::event::{LinkEvent, MonEvent};
use crate::handle::Handle;
use crate::link::Link;
use crate::mode::{ObjectMode, RetireKind, SyncMode};
use crate::value::DataType;

pub(crate) struct NetHandle {
    pub item: Handle,
    net_id: u32,
    queue_num: i64,
    update_count_stop: u32,
    cur_echo_seq: i8,
    dirty: bool,
    dirty_mode: bool,
    disabled: bool,
    monitor: bool,
    block_echo: bool,
    ini_master: bool,
    ini_slave: bool,
    sync_flux: bool,
    save_flux: bool,
}

impl NetHandle {
    pub fn new(item: Handle) -> NetHandle {
        // A net item always acts on its own half of a pair; crossing again
        // on import would bounce updates between the twins forever.
        item.set_uncrossed(true);
        item.set_ignore_same_value(false);
        NetHandle {
            item,
            net_id: 0,
            queue_num: 0,
            update_count_stop: 0,
            cur_echo_seq: -1,
            dirty: false,
            dirty_mode: false,
            disabled: false,
            monitor: false,
            block_echo: false,
            ini_master: false,
            ini_slave: false,
            sync_flux: false,
            save_flux: false,
        }
    }

    pub fn set_net_id(&mut self, net_id: u32) {
        self.net_id = net_id;
    }

    pub fn net_id(&self) -> u32 {
        self.net_id
    }

    pub fn link(&self) -> Option<std::sync::Arc<Link>> {
        self.item.core().link()
    }

    pub fn path(&self) -> String {
        self.item.path()
    }

    pub fn is_open(&self) -> bool {
        self.item.is_open()
    }

    pub fn is_folder(&self) -> bool {
        self.item.is_folder()
    }

    pub fn is_pipe_mode(&self) -> bool {
        self.item.is_pipe_mode()
    }

    pub fn data_type(&self) -> DataType {
        self.item.data_type()
    }

    // ---- sync-mode wire strings ---------------------------------------

    /// Applies a `smode` field. `link_share` is false for server items:
    /// the sync mode then belongs to the session, not the link.
    pub fn add_sync_mode_wire(&mut self, smode: &[u8], link_share: bool) {
        let has = |word: &[u8]| smode.windows(word.len()).any(|w| w == word);

        self.set_ini_master(has(b"inimast"));
        self.set_ini_slave(has(b"inislave"));

        let mut sync_mode = SyncMode::empty();
        sync_mode.set(SyncMode::MASTER, has(b"master") || self.ini_slave);
        sync_mode.set(SyncMode::AUTO_DESTROY, has(b"autodestroy"));
        sync_mode.set(SyncMode::MONITOR, has(b"mon"));

        self.item.add_sync_mode(sync_mode, link_share);
    }

    pub fn sync_mode_wire(&self) -> Vec<u8> {
        let sync_mode = self.item.sync_mode();
        let mut s: Vec<&str> = Vec::new();
        if self.ini_slave {
            s.push("inislave");
        } else if sync_mode.contains(SyncMode::MASTER) {
            s.push("master");
        } else if self.ini_master {
            s.push("inimast");
        }
        if sync_mode.contains(SyncMode::AUTO_DESTROY) {
            s.push("autodestroy");
        }
        if sync_mode.contains(SyncMode::MONITOR) {
            s.push("mon");
        }
        s.join(" ").into_bytes()
    }

    pub fn set_mode_wire(&self, data: &[u8]) {
        self.item.add_mode(ObjectMode::from_wire(data));
    }

    pub fn mode_wire(&self) -> Vec<u8> {
        self.item.get_mode().to_wire().into_bytes()
    }

    // ---- monitor ------------------------------------------------------

    pub fn is_monitor(&self) -> bool {
        self.monitor
    }

    pub fn set_monitor(&mut self, monitor: bool) {
        self.monitor = monitor;
    }

    /// Emits a monitor event on this handle's link, tagged with the
    /// session it belongs to.
    pub fn send_mon_event(&self, ev: MonEvent, data: &[u8], is_local: bool, session_tag: u64) {
        if let Some(link) = self.link() {
            link.send_event(&LinkEvent::Monitor {
                ev,
                data: data.to_vec(),
                is_local,
                session_tag,
            });
        }
    }

    /// Announces one (existing or new) item below a monitored folder.
    pub fn send_new_item_mon_event(&self, path: &str, is_old: bool, session_tag: u64) {
        let ev = if is_old { MonEvent::ItemFound } else { MonEvent::ItemCreated };
        self.send_mon_event(ev, path.as_bytes(), true, session_tag);
    }

    // ---- send bookkeeping ---------------------------------------------

    pub fn set_disabled(&mut self) {
        self.disabled = true;
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn set_queue_num(&mut self, num: i64) {
        self.queue_num = num;
    }

    pub fn queue_num(&self) -> i64 {
        self.queue_num
    }

    pub fn next_echo_seq(&mut self) {
        self.cur_echo_seq = (self.cur_echo_seq + 1) % 100;
    }

    pub fn reset_echo_seq(&mut self) {
        self.cur_echo_seq = -1;
    }

    pub fn set_echo_seq(&mut self, echo_seq: i8) {
        self.cur_echo_seq = echo_seq;
    }

    pub fn echo_seq(&self) -> i8 {
        if self.is_pipe_mode() {
            -1
        } else {
            self.cur_echo_seq
        }
    }

    /// True when a received echo sequence does not match the current one,
    /// i.e. the echo is from an older write.
    pub fn is_echo_seq_old(&self, received: i8) -> bool {
        if self.cur_echo_seq < 0 || received < 0 {
            return false;
        }
        received != self.cur_echo_seq
    }

    pub fn reset_dirty_value(&mut self) {
        self.dirty = false;
        self.ini_master = false;
        self.ini_slave = false;
        self.sync_flux = false;
        self.item.reset_only_echo();
    }

    pub fn reset_dirty_mode(&mut self) {
        self.dirty_mode = false;
    }

    pub fn is_dirty_mode(&self) -> bool {
        self.dirty_mode
    }

    /// First value update since the last send marks the leader; later ones
    /// coalesce into the pending queue entry.
    pub fn is_lead_value_update(&mut self) -> bool {
        if self.dirty {
            return false;
        }
        self.dirty = true;
        true
    }

    pub fn is_lead_mode_update(&mut self) -> bool {
        if self.dirty_mode {
            return false;
        }
        self.dirty_mode = true;
        true
    }

    /// A client-side item blocks updates initiated by itself, so remote
    /// imports never loop back out.
    pub fn set_block_echo(&mut self, block_echo: bool) {
        self.block_echo = block_echo;
    }

    pub fn is_block(&self, send_id: u32) -> bool {
        self.block_echo && send_id == self.item.id()
    }

    pub fn is_only_echo(&self) -> bool {
        self.item.is_only_echo()
    }

    pub fn add_is_only_echo(&self, send_id: u32) {
        self.item.add_is_only_echo(send_id);
    }

    // ---- initial-sync bias --------------------------------------------

    pub fn set_ini_master(&mut self, ini_master: bool) {
        self.ini_master = ini_master;
        if ini_master {
            self.ini_slave = false;
        }
    }

    pub fn set_ini_slave(&mut self, ini_slave: bool) {
        self.ini_slave = ini_slave;
        if ini_slave {
            self.ini_master = false;
        }
    }

    pub fn is_master(&self) -> bool {
        self.item.is_master()
    }

    pub fn is_master_at_start(&self) -> bool {
        !self.ini_slave && (self.ini_master || self.is_master())
    }

    pub fn set_sync_flux(&mut self, sync_flux: bool) {
        self.sync_flux = sync_flux;
    }

    pub fn is_sync_flux(&self) -> bool {
        self.sync_flux
    }

    pub fn set_save_flux(&mut self, save_flux: bool) {
        self.save_flux = save_flux;
    }

    pub fn is_save_flux(&self) -> bool {
        self.save_flux
    }

    pub fn local_update_since_stop(&self) -> u32 {
        self.item.local_update_count().wrapping_sub(self.update_count_stop)
    }

    /// Called when the connection drops; the delta since this point
    /// decides ini-master on reconnect.
    pub fn on_connect_stop(&mut self) {
        self.update_count_stop = self.item.local_update_count();
    }

    pub fn retire_kind(&self) -> RetireKind {
        self.item.retire_kind()
    }
}
