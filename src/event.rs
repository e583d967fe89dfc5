//! Link events and their delivery machinery.
//!
//! Mutations of the tree produce [`LinkEvent`]s which are pushed to every
//! subscriber of the affected link (and, for structural events, to its
//! ancestors). A subscriber receives events through its [`Delivery`] mode:
//! either a direct callback on the mutating thread, or a queued intake
//! drained by the owning task. A queued event holds only a weak target
//! reference, so closing a handle cancels everything still in flight for
//! it.
//!
//! Zero-ref notifications do not appear here: they always target the
//! registry thread and travel on its request channel.

use std::sync::{Arc, Weak};

use crossbeam_queue::SegQueue;
use tokio::sync::Notify;

use crate::handle::HandleCore;
use crate::link::Link;
use crate::mode::ObjectMode;

/// Write metadata riding along a value change, from the caller down to the
/// link commit and out to the subscribers.
#[derive(Debug, Clone, Default)]
pub struct WriteMeta {
    /// The write came in over a sync session; it must not count as a local
    /// update.
    pub from_remote: bool,
    /// The write was loaded from the persist store.
    pub from_persist: bool,
    /// The payload bytes are utf-8 text.
    pub text: bool,
    /// Pipe queue overwrite pattern (see the sync session).
    pub queue_find_regexp: Option<String>,
    /// Sequence-number metadata forwarded on the wire.
    pub seq_no: Option<i64>,
}

impl WriteMeta {
    pub fn null() -> Self {
        WriteMeta::default()
    }

    pub fn remote() -> Self {
        WriteMeta { from_remote: true, ..Default::default() }
    }

    pub fn is_null(&self) -> bool {
        !self.from_remote
            && !self.from_persist
            && !self.text
            && self.queue_find_regexp.is_none()
            && self.seq_no.is_none()
    }
}

/// An atomic read-modify-write operation on an integer or real cell.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum AtomicOp {
    BitSet { mask: i64, value: i64 },
    AddInt(i64),
    AddReal(f64),
}

/// Monitor event kinds carried by `event` records and local monitor
/// bootstrap.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MonEvent {
    ItemCreated,
    ItemFound,
    ItemDeleted,
    ItemModeChg,
    MonitorStart,
    MonitorReStart,
}

impl MonEvent {
    pub fn as_wire(&self) -> &'static str {
        match self {
            MonEvent::ItemCreated => "itemCreated",
            MonEvent::ItemFound => "itemFound",
            MonEvent::ItemDeleted => "itemDeleted",
            MonEvent::ItemModeChg => "itemModeChg",
            MonEvent::MonitorStart => "monitorStart",
            MonEvent::MonitorReStart => "monitorReStart",
        }
    }

    pub fn from_wire(name: &[u8]) -> Option<Self> {
        Some(match name {
            b"itemCreated" => MonEvent::ItemCreated,
            b"itemFound" => MonEvent::ItemFound,
            b"itemDeleted" => MonEvent::ItemDeleted,
            b"itemModeChg" => MonEvent::ItemModeChg,
            b"monitorStart" => MonEvent::MonitorStart,
            b"monitorReStart" => MonEvent::MonitorReStart,
            _ => return None,
        })
    }
}

/// One event on a link, delivered to subscribers.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A committed write. `value_data` carries the exported bytes for pipes
    /// and remote-bound text writes.
    ValueChanged { send_id: u32, value_data: Option<Arc<[u8]>>, meta: WriteMeta },
    /// Pipe/save/bidir mode of the link changed.
    ModeChanged { path: String, link_id: u32, mode: ObjectMode },
    /// A new link appeared below the receiving link.
    LinkCreated { path: String, link: Arc<Link>, is_last: bool },
    /// The link (or something below it) was retired.
    Retired { start: Arc<Link>, is_below: bool, is_global: bool },
    /// Atomic operation forwarded between a twin pair.
    AtomicOp { op: AtomicOp },
    /// Monitor traffic (tree watch events), scoped to one session.
    Monitor { ev: MonEvent, data: Vec<u8>, is_local: bool, session_tag: u64 },
}

/// A queued event plus the handle it targets. The target going away (or
/// being closed) turns delivery into a no-op.
pub struct QueuedEvent {
    pub target: Weak<HandleCore>,
    pub event: LinkEvent,
}

/// Unbounded event intake for cross-thread delivery.
///
/// Sinks push from whatever thread committed the mutation; the owner
/// (session task or user) drains. The notify handle lets a tokio task
/// `await` new events.
pub struct EventIntake {
    queue: SegQueue<QueuedEvent>,
    notify: Notify,
}

impl EventIntake {
    pub fn new() -> Arc<Self> {
        Arc::new(EventIntake { queue: SegQueue::new(), notify: Notify::new() })
    }

    pub fn push(&self, ev: QueuedEvent) {
        self.queue.push(ev);
        self.notify.notify_one();
    }

    /// Pops one pending event whose target is still live and open.
    pub fn pop(&self) -> Option<(Arc<HandleCore>, LinkEvent)> {
        while let Some(qe) = self.queue.pop() {
            if let Some(core) = qe.target.upgrade() {
                if !core.is_closed() {
                    return Some((core, qe.event));
                }
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// How a subscriber's events reach it.
#[derive(Clone, Default)]
pub enum Delivery {
    /// Apply the default handle policy and invoke the callback (if any) on
    /// the mutating thread.
    #[default]
    Direct,
    /// Clone the event into an intake drained by the owning task.
    Queue(Arc<EventIntake>),
}
