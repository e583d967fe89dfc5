//! Network synchronization of the shared object tree.
//!
//! One session core per TCP connection runs the record protocol: version
//! and info negotiation, login, then incremental sync of values, modes and
//! tree events. [`client::Client`] drives the connecting side with
//! reconnect logic and mount points; [`server::Server`] accepts
//! connections and enforces login and the allow mask.

pub mod client;
pub mod login;
pub mod monitor;
pub(crate) mod net_handle;
pub(crate) mod pattern;
pub mod server;
pub mod session;
pub mod stream;
#[cfg(test)]
mod tests;

use bitflags::bitflags;
use num_derive::FromPrimitive;

use crate::event::AtomicOp;
use crate::value::format_real;

/// Protocol version advertised by this implementation.
pub const SYNC_VERSION: &str = "5.0";
pub const SYNC_VERSION_MAJOR: u32 = 5;
/// Value of the `type` field in `ver` records.
pub const SYNC_TYPE: &str = "SyncTree";

bitflags! {
    /// Operations a peer grants this session.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct Allow: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        const CREATE = 0x04;
        const DELETE = 0x08;
        const MODE_CHANGE = 0x10;
    }
}

impl Allow {
    pub const READ_WRITE: Allow = Allow::READ.union(Allow::WRITE);

    pub fn to_bits_i64(self) -> i64 {
        self.bits() as i64
    }

    pub fn from_bits_i64(bits: i64) -> Allow {
        Allow::from_bits_truncate(bits as u32)
    }
}

/// Per-connection protocol state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncState {
    Init,
    /// Getting the version of the remote side.
    Version,
    /// Exchanging static meta info (encryption, free paths, who-i-am).
    Info,
    /// Authenticating.
    Login,
    /// Normal syncing.
    Normal,
}

/// Info types of the `info`/`Rinfo` negotiation. Application info types
/// use values below 1000.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
#[repr(i64)]
pub enum InfoType {
    Start = 1000,
    /// Paths accessible without login.
    FreePaths = 1001,
    /// Opaque self-description of each end.
    WhoIAm = 1002,
    EncryptAsk = 1101,
    EncryptReq = 1102,
    EncryptRdy = 1103,
}

/// Special `message` record types.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
#[repr(i64)]
pub enum MessageType {
    KillRequest = 1001,
    AbortKillRequest = 1002,
    ChatNormal = 1008,
    ChatPrio = 1009,
}

/// Whether a session wants its socket upgraded to TLS.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, FromPrimitive)]
#[repr(i64)]
pub enum EncryptPolicy {
    /// Encryption not available (also the legacy-peer default).
    Refuse = 0,
    #[default]
    PreferNo = 1,
    PreferYes = 2,
    MustHave = 3,
}

/// Combines both ends' encryption policies.
/// `None` = disagree (abort); `Some(true)` = use TLS; `Some(false)` = plain.
pub fn check_encrypt_policy(local: EncryptPolicy, remote: EncryptPolicy) -> Option<bool> {
    use EncryptPolicy::*;
    match (local, remote) {
        (MustHave, Refuse) | (Refuse, MustHave) => None,
        (MustHave, _) | (_, MustHave) => Some(true),
        (PreferYes, PreferYes) => Some(true),
        _ => Some(false),
    }
}

/// How a client biases the initial value sync of its handles.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ClientSyncMode {
    Invalid,
    /// Push when updated since the connection stopped, accept otherwise.
    #[default]
    StdAutoMaster,
    /// Any local update promotes the handle to master.
    ImplicitMaster,
    /// Only user-set master handles push.
    ExplicitMaster,
}

/// Connection status reported to the application, with the priority of
/// the host entry in use.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectStat {
    Connecting,
    /// TCP is up, protocol negotiation is running.
    Negotiating,
    Connected,
    /// Connected but no bytes received within the receive timeout.
    Stopped,
    Error,
    Disconnected,
    /// The whole host list was tried without success.
    TriedAll,
}

/// Login failure context given to `login_required` observers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoginReason {
    /// First try for this connection; credentials wanted.
    FirstTry,
    /// Server denied the credentials; retry possible.
    ServerDeny,
    /// Client denied the server (bad mutual verification).
    ClientDenyBadServer,
    /// Legacy server without login support.
    NoLoginSupport,
    /// Negotiation records arrived out of sequence.
    BadSequence,
    /// Encryption policy could not be satisfied.
    EncryptMismatch,
}

impl LoginReason {
    pub fn code(self) -> i64 {
        match self {
            LoginReason::FirstTry => 0,
            LoginReason::ServerDeny => 1,
            LoginReason::ClientDenyBadServer => 2,
            LoginReason::NoLoginSupport => 3,
            LoginReason::BadSequence => 4,
            LoginReason::EncryptMismatch => 5,
        }
    }
}

pub(crate) fn atomic_op_to_wire(op: &AtomicOp) -> (&'static str, String, Option<String>) {
    match op {
        AtomicOp::BitSet { mask, value } => ("bitSet", mask.to_string(), Some(value.to_string())),
        AtomicOp::AddInt(v) => ("addInt", v.to_string(), None),
        AtomicOp::AddReal(v) => ("addReal", format_real(*v), None),
    }
}

pub(crate) fn atomic_op_from_wire(op: &[u8], a1: &[u8], a2: &[u8]) -> Option<AtomicOp> {
    let a1_str = std::str::from_utf8(a1).ok()?;
    match op {
        b"bitSet" => Some(AtomicOp::BitSet {
            mask: a1_str.parse().ok()?,
            value: std::str::from_utf8(a2).ok()?.parse().ok()?,
        }),
        b"addInt" => Some(AtomicOp::AddInt(a1_str.parse().ok()?)),
        b"addReal" => Some(AtomicOp::AddReal(a1_str.parse().ok()?)),
        _ => None,
    }
}
