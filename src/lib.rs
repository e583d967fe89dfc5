//! synctree - a distributed shared-object registry.
//!
//! A process holds a hierarchically named tree of typed data cells.
//! Applications observe and mutate the cells through lightweight
//! [`Handle`]s; a [`sync::client::Client`] or [`sync::server::Server`]
//! mirrors the tree between cooperating processes over a framed TCP
//! protocol, preserving per-object ordering, suppressing echoes and
//! riding out disconnects.

mod error;
mod event;
mod handle;
mod link;
mod mode;
pub mod path;
pub mod persist;
mod registry;
pub mod sync;
mod value;
pub mod wire;

pub use error::{ErrCode, Error, ErrorLog, Result};
pub use event::{AtomicOp, EventIntake, LinkEvent, MonEvent, WriteMeta};
pub use handle::{ExportCode, Handle};
pub use link::Link;
pub use mode::{LinkFlags, ObjectMode, RetireKind, SyncMode};
pub use registry::Registry;
pub use value::{DataType, Variant, VariantRepr};

pub use sync::client::{Client, ClientConfig, ClientEvent, HostAddr};
pub use sync::login::LoginTable;
pub use sync::monitor::Monitor;
pub use sync::server::{Server, ServerConfig};
pub use sync::stream::TlsConfig;
pub use sync::{Allow, ClientSyncMode, ConnectStat, EncryptPolicy, LoginReason, SyncState};
