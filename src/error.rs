//! Error taxonomy and the process-wide error log.
//!
//! Every fallible registry or protocol operation reports one of the codes in
//! [`ErrCode`]. Messages go to an optional application sink; without a sink
//! they are emitted through `tracing`.

use std::fmt;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

/// Result alias used across the registry and sync layers.
pub type Result<T> = std::result::Result<T, Error>;

/// Error codes, stable over the wire in `err` records.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrCode {
    Ok,
    Warning,
    /// Can't create a link (kind mismatch, bad name, create not allowed).
    CreateError,
    NotFound,
    NotOpen,
    AlreadyExist,
    AlreadyOpen,
    FolderNotOpen,
    ItemNotOpen,
    ItemNotSet,
    /// Access to a retired link.
    Retired,
    NotMainThread,
    ConnectionError,
    /// Unknown record type received.
    RecUnknown,
    ScriptError,
    RpcInvokeError,
    RpcReceiveError,
    LoginBad,
    /// Record type not expected in the current protocol state.
    RecNotExpected,
    /// Operation denied, no privilege.
    OpNotAllowed,
    NeedEncrypted,
    Undef,
}

impl ErrCode {
    pub fn as_text(&self) -> &'static str {
        match self {
            ErrCode::Ok => "Ok",
            ErrCode::Warning => "Warning",
            ErrCode::CreateError => "Can't create",
            ErrCode::NotFound => "Not found",
            ErrCode::NotOpen => "Not open",
            ErrCode::AlreadyExist => "Already exist",
            ErrCode::AlreadyOpen => "Already open",
            ErrCode::FolderNotOpen => "Folder is not open",
            ErrCode::ItemNotOpen => "Item is not open",
            ErrCode::ItemNotSet => "Item is not set",
            ErrCode::Retired => "Access to retired",
            ErrCode::NotMainThread => "Not main thread",
            ErrCode::ConnectionError => "Connection error",
            ErrCode::RecUnknown => "Unknown record type",
            ErrCode::ScriptError => "Script",
            ErrCode::RpcInvokeError => "Rpc Invoke error",
            ErrCode::RpcReceiveError => "Rpc Receive error",
            ErrCode::LoginBad => "Login error",
            ErrCode::RecNotExpected => "Not expected record type here",
            ErrCode::OpNotAllowed => "Operation denied, no privilege",
            ErrCode::NeedEncrypted => "Encryption needed",
            ErrCode::Undef => "Undefined",
        }
    }
}

/// A typed error carrying its taxonomy code and a context message.
#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrCode,
    pub msg: String,
}

impl Error {
    pub fn new(code: ErrCode, msg: impl Into<String>) -> Self {
        Self { code, msg: msg.into() }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{}", self.code.as_text())
        } else {
            write!(f, "{}: {}", self.code.as_text(), self.msg)
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::new(ErrCode::ConnectionError, err.to_string())
    }
}

type ErrorSink = Box<dyn Fn(&str, ErrCode) + Send + Sync>;

/// Process-wide error channel. One per [`crate::Registry`].
///
/// Messages are forwarded to the application sink when one is installed,
/// otherwise logged via `tracing` (and to stderr when console mode is on).
pub struct ErrorLog {
    inner: Mutex<ErrorLogInner>,
}

struct ErrorLogInner {
    sink: Option<ErrorSink>,
    console: bool,
}

impl ErrorLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: Mutex::new(ErrorLogInner { sink: None, console: true }) })
    }

    /// Installs an application sink. Disables console echoing.
    pub fn set_sink(&self, sink: ErrorSink) {
        let mut inner = self.inner.lock();
        inner.sink = Some(sink);
        inner.console = false;
    }

    pub fn set_console(&self, on: bool) {
        self.inner.lock().console = on;
    }

    pub fn log(&self, text: &str, code: ErrCode) {
        let inner = self.inner.lock();
        if let Some(sink) = &inner.sink {
            sink(text, code);
        } else {
            tracing::error!(code = code.as_text(), "{}", text);
            if inner.console {
                eprintln!("{}: {}", code.as_text(), text);
            }
        }
    }

    pub fn log_err(&self, err: &Error) {
        self.log(&err.msg, err.code);
    }
}
