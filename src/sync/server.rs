//! The accepting side of sync sessions.
//!
//! One [`Server`] binds a TCP listener and spawns an independent session
//! task per connection. Every live session is registered as a leaf under
//! `Sys/Server/Sessions/` carrying the peer address, and removed again on
//! disconnect.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::login::LoginTable;
use super::session::{SessionConfig, SessionCore};
use super::stream::{NetStream, TlsConfig};
use super::EncryptPolicy;
use crate::path;
use crate::registry::Registry;
use crate::wire::{RecOptions, RecordMap};

/// Construction-time server settings.
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Force clients through the login handshake. Implied by a non-empty
    /// login table.
    pub demand_login: bool,
    pub login_table: LoginTable,
    /// Paths accessible without login, besides the built-in legal tree.
    pub free_paths: Vec<String>,
    pub who_i_am: RecordMap,
    pub encrypt_policy: EncryptPolicy,
    pub tls: Option<TlsConfig>,
    pub receive_timeout: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "0.0.0.0".to_string(),
            port: path::DEFAULT_TCP_PORT,
            demand_login: false,
            login_table: LoginTable::new(),
            free_paths: Vec::new(),
            who_i_am: RecordMap::new(),
            encrypt_policy: EncryptPolicy::PreferNo,
            tls: None,
            receive_timeout: 10,
        }
    }
}

struct ServerShared {
    registry: Registry,
    login_table: Arc<LoginTable>,
    demand_login: bool,
    free_paths: Vec<String>,
    who_i_am: Vec<u8>,
    encrypt_policy: EncryptPolicy,
    tls: Option<TlsConfig>,
    receive_timeout: u32,
}

/// A listening sync server.
pub struct Server {
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the listener and starts accepting. Pass port 0 to get an
    /// ephemeral port (see [`Server::local_addr`]).
    pub async fn bind(registry: &Registry, cfg: ServerConfig) -> io::Result<Server> {
        let listener = TcpListener::bind((cfg.bind_addr.as_str(), cfg.port)).await?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(ServerShared {
            registry: registry.clone(),
            demand_login: cfg.demand_login || !cfg.login_table.is_empty(),
            login_table: Arc::new(cfg.login_table),
            free_paths: cfg.free_paths,
            who_i_am: cfg.who_i_am.to_line(RecOptions::default()),
            encrypt_policy: cfg.encrypt_policy,
            tls: cfg.tls,
            receive_timeout: cfg.receive_timeout,
        });

        tokio::spawn(accept_forever(listener, shared));
        Ok(Server { local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn accept_forever(listener: TcpListener, shared: Arc<ServerShared>) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                continue;
            }
        };
        let _ = socket.set_nodelay(true);
        tokio::spawn(serve_session(socket, peer, shared.clone()));
    }
}

async fn serve_session(socket: TcpStream, peer: SocketAddr, shared: Arc<ServerShared>) {
    tracing::debug!(%peer, "session start");

    let mut cfg = SessionConfig::server();
    cfg.demand_login = shared.demand_login;
    cfg.login_table = Some(shared.login_table.clone());
    cfg.encrypt_policy = shared.encrypt_policy;
    cfg.tls = shared.tls.clone();
    cfg.who_i_am = shared.who_i_am.clone();
    cfg.receive_timeout = shared.receive_timeout;

    let mut core = SessionCore::new(shared.registry.clone(), cfg);
    for free in &shared.free_paths {
        core.add_free_path(free);
    }
    core.start_server();

    // Register this session in the tree for observers.
    let session_path = format!(
        "{}{}{}/value",
        path::PATH_LOCAL,
        path::PATH_SERVER_SESSIONS,
        uuid::Uuid::new_v4()
    );
    shared.registry.set_string(&session_path, &peer.to_string());

    // The sender half is kept so the command channel stays open for the
    // session's whole life.
    let (_cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    let end = core.drive(NetStream::Plain(socket), &mut cmd_rx).await;
    core.disconnected();

    shared.registry.destroy_path(&path::parent_path(&session_path), false);
    tracing::debug!(%peer, ?end, "session end");
}
