//! Flag sets shared by the tree, handles and the sync layer.

use bitflags::bitflags;

bitflags! {
    /// General mode of a link.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct ObjectMode: u32 {
        /// A pair of value and provider links. Implied by having a twin.
        const BIDIR = 0x01;
        /// Transient event stream; never deduplicated. Forces `BIDIR`.
        const PIPE = 0x02;
        /// Persisted by the (external) persist store.
        const SAVE = 0x04;
    }
}

impl ObjectMode {
    /// Wire rendering used by `mode` records and mode-change events.
    pub fn to_wire(self) -> String {
        let mut s = String::new();
        if self.contains(ObjectMode::PIPE) {
            s.push('P');
        }
        if self.contains(ObjectMode::BIDIR) {
            s.push('B');
        }
        if self.contains(ObjectMode::SAVE) {
            s.push('S');
        }
        s
    }

    pub fn from_wire(data: &[u8]) -> Self {
        let mut mode = ObjectMode::empty();
        if data.contains(&b'P') {
            mode |= ObjectMode::PIPE;
        }
        if data.contains(&b'V') || data.contains(&b'B') {
            // 'V' is the legacy rendering of bidirectional
            mode |= ObjectMode::BIDIR;
        }
        if data.contains(&b'S') {
            mode |= ObjectMode::SAVE;
        }
        mode
    }
}

bitflags! {
    /// Per-session sync mode of a shared object.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct SyncMode: u32 {
        /// This end originates the value at the start of a session.
        const MASTER = 0x01;
        /// The object is deleted when the creating session drops.
        const AUTO_DESTROY = 0x02;
        /// Subscribe to create/delete events in the subtree.
        const MONITOR = 0x04;
    }
}

bitflags! {
    /// Flags steering link lookup and creation.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct LinkFlags: u32 {
        const FOLDER = 0x01;
        const CREATE_ALLOWED = 0x02;
        /// Suppress error logging for an expectable failure.
        const SILENT_ERROR = 0x04;
        /// The lookup comes from a thread other than the registry thread.
        /// Added automatically by the registry proxy; the visited links
        /// and their ancestors become threaded. Passing it explicitly at
        /// open additionally switches the handle to queued delivery.
        const THREADED = 0x08;
        /// This is the terminal segment of the requested path.
        const LAST_LINK = 0x10;
    }
}

/// What kind of retirement a link has entered.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum RetireKind {
    #[default]
    None,
    /// Part of a retired subtree.
    Tree,
    /// Leaf retired in this process only.
    LeafLocal,
    /// Leaf retired globally, peers are told to delete too.
    LeafGlobal,
}
