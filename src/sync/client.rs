//! The connecting side of a sync session.
//!
//! A [`Client`] owns one long-lived session core and a prioritized list of
//! host candidates. Its task loops: pick the next host, connect, negotiate
//! and sync until the connection drops, then walk on (waiting `retry_time`
//! once the list is exhausted). Handles opened under a mount point are
//! shared automatically; re-contact/re-connect edges are reported so the
//! application can apply idempotency measures at the right boundary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use num_traits::FromPrimitive;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::login::password_hash;
use super::session::{DriveEnd, SessionCmd, SessionConfig, SessionCore, SessionEvent, SessionShared};
use super::stream::{NetStream, TlsConfig};
use super::{Allow, ClientSyncMode, ConnectStat, EncryptPolicy, LoginReason, MessageType, SyncState};
use crate::error::{ErrCode, Error, Result};
use crate::mode::SyncMode;
use crate::path;
use crate::registry::Registry;
use crate::wire::RecordMap;

/// One host candidate in the connection list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddr {
    pub addr: String,
    pub port: u16,
}

/// Construction-time client settings.
pub struct ClientConfig {
    pub sync_mode: ClientSyncMode,
    pub demand_login: bool,
    pub encrypt_policy: EncryptPolicy,
    pub receive_timeout: u32,
    pub who_i_am: RecordMap,
    pub tls: Option<TlsConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            sync_mode: ClientSyncMode::StdAutoMaster,
            demand_login: false,
            encrypt_policy: EncryptPolicy::PreferNo,
            receive_timeout: 10,
            who_i_am: RecordMap::new(),
            tls: None,
        }
    }
}

/// Notifications surfaced by a client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionStatus { stat: ConnectStat, prio: i32 },
    TcpConnected { host: String, port: u16 },
    TcpDisconnected,
    TcpError(String),
    SyncStateChanged(SyncState),
    LoginRequired(LoginReason),
    LoginCompleted { user: String },
    KillRequested,
    ChatReceived { text: String, prio: bool },
    ReplyGet { data: Vec<u8>, path: String },
    ReplyLs { items: Vec<String>, path: String },
    ReplyInfo { info_type: i64, data: Vec<u8> },
    ReplyVer { text: String },
    HeartBeatChanged(bool),
}

enum ClientCtrl {
    Start,
}

#[derive(Default)]
struct HostConfig {
    hosts: Vec<(HostAddr, i32)>,
    single: Option<HostAddr>,
    auto_connect: bool,
    retry_time: u32,
    credentials: Option<(String, String, Allow)>,
    valid_credent: bool,
}

struct ClientFlags {
    connect_stat: Mutex<Option<ConnectStat>>,
    cur_prio: AtomicI32,
    was_contact: AtomicBool,
    was_connect: AtomicBool,
    is_re_contact: AtomicBool,
    is_re_connect: AtomicBool,
    closed: AtomicBool,
}

struct ClientInner {
    registry: Registry,
    cmd_tx: mpsc::UnboundedSender<SessionCmd>,
    ctrl_tx: mpsc::UnboundedSender<ClientCtrl>,
    events_rx: async_channel::Receiver<ClientEvent>,
    shared: Arc<SessionShared>,
    host_cfg: Arc<Mutex<HostConfig>>,
    flags: Arc<ClientFlags>,
    mounts: Mutex<Vec<(String, String)>>,
    id: Mutex<String>,
}

/// The application-facing client handle. Cloneable; the underlying session
/// lives until the last clone is dropped.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(registry: &Registry) -> Client {
        Client::with_config(registry, ClientConfig::default())
    }

    /// Must be called within a tokio runtime; the client task is spawned
    /// immediately.
    pub fn with_config(registry: &Registry, cfg: ClientConfig) -> Client {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        // Notifications are dropped when nobody drains them.
        let (app_tx, app_rx) = async_channel::bounded(256);
        let (sess_tx, sess_rx) = async_channel::unbounded();

        let mut session_cfg = SessionConfig::client();
        session_cfg.client_sync_mode = cfg.sync_mode;
        session_cfg.demand_login = cfg.demand_login;
        session_cfg.encrypt_policy = cfg.encrypt_policy;
        session_cfg.receive_timeout = cfg.receive_timeout;
        session_cfg.who_i_am = cfg.who_i_am.to_line(crate::wire::RecOptions::default());
        session_cfg.tls = cfg.tls;

        let mut core = SessionCore::new(registry.clone(), session_cfg);
        core.set_events(sess_tx);
        let shared = core.shared();

        let host_cfg = Arc::new(Mutex::new(HostConfig {
            retry_time: 2,
            ..Default::default()
        }));
        let flags = Arc::new(ClientFlags {
            connect_stat: Mutex::new(None),
            cur_prio: AtomicI32::new(-1),
            was_contact: AtomicBool::new(false),
            was_connect: AtomicBool::new(false),
            is_re_contact: AtomicBool::new(false),
            is_re_connect: AtomicBool::new(false),
            closed: AtomicBool::new(true),
        });

        let task = ClientTask {
            core,
            cmd_rx,
            ctrl_rx,
            sess_rx,
            app_tx,
            cmd_tx: cmd_tx.clone(),
            host_cfg: host_cfg.clone(),
            flags: flags.clone(),
            next_host: -1,
        };
        tokio::spawn(task.run());

        Client {
            inner: Arc::new(ClientInner {
                registry: registry.clone(),
                cmd_tx,
                ctrl_tx,
                events_rx: app_rx,
                shared,
                host_cfg,
                flags,
                mounts: Mutex::new(Vec::new()),
                id: Mutex::new(String::new()),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Stream of client notifications. Each call returns a fresh receiver
    /// sharing the same queue.
    pub fn events(&self) -> async_channel::Receiver<ClientEvent> {
        self.inner.events_rx.clone()
    }

    // ---- connection management ------------------------------------------

    pub fn connect_to_host(&self, host: &str, port: u16) {
        {
            let mut cfg = self.inner.host_cfg.lock();
            cfg.single = Some(HostAddr {
                addr: host.to_string(),
                port: if port == 0 { path::DEFAULT_TCP_PORT } else { port },
            });
            cfg.valid_credent = false;
        }
        self.reset_connection_flags();
        self.inner.flags.closed.store(false, Ordering::Relaxed);
        let _ = self.inner.ctrl_tx.send(ClientCtrl::Start);
    }

    /// Connects walking the prioritized host list.
    pub fn connect_to_list(&self) {
        {
            let mut cfg = self.inner.host_cfg.lock();
            if cfg.hosts.is_empty() {
                return;
            }
            cfg.single = None;
            cfg.valid_credent = false;
        }
        self.reset_connection_flags();
        self.inner.flags.closed.store(false, Ordering::Relaxed);
        let _ = self.inner.ctrl_tx.send(ClientCtrl::Start);
    }

    fn reset_connection_flags(&self) {
        let flags = &self.inner.flags;
        flags.was_contact.store(false, Ordering::Relaxed);
        flags.was_connect.store(false, Ordering::Relaxed);
        flags.is_re_contact.store(false, Ordering::Relaxed);
        flags.is_re_connect.store(false, Ordering::Relaxed);
    }

    pub fn add_to_host_list(&self, host: &str, port: u16, prio: i32) {
        if host.is_empty() {
            return;
        }
        let slot = HostAddr {
            addr: host.to_string(),
            port: if port == 0 { path::DEFAULT_TCP_PORT } else { port },
        };
        let mut cfg = self.inner.host_cfg.lock();
        let pos = cfg.hosts.iter().position(|(_, p)| prio < *p).unwrap_or(cfg.hosts.len());
        cfg.hosts.insert(pos, (slot, prio));
    }

    /// Clears the host list, or only the entries of one priority.
    pub fn clear_host_list(&self, prio_filter: Option<i32>) {
        let mut cfg = self.inner.host_cfg.lock();
        match prio_filter {
            None => cfg.hosts.clear(),
            Some(prio) => cfg.hosts.retain(|(_, p)| *p != prio),
        }
    }

    pub fn host_list(&self, prio_filter: Option<i32>) -> Vec<HostAddr> {
        let cfg = self.inner.host_cfg.lock();
        cfg.hosts
            .iter()
            .filter(|(_, p)| prio_filter.map(|f| f == *p).unwrap_or(true))
            .map(|(h, _)| h.clone())
            .collect()
    }

    pub fn set_auto_connect(&self, is_auto: bool, retry_time: u32) {
        let mut cfg = self.inner.host_cfg.lock();
        cfg.auto_connect = is_auto;
        cfg.retry_time = retry_time.max(1);
    }

    /// Stops syncing: drains the queues, sends `exit` and disconnects.
    pub fn close(&self) {
        self.inner.flags.closed.store(true, Ordering::Relaxed);
        {
            let mut cfg = self.inner.host_cfg.lock();
            cfg.auto_connect = false;
        }
        let _ = self.inner.cmd_tx.send(SessionCmd::Close);
    }

    pub fn connect_status(&self) -> Option<ConnectStat> {
        *self.inner.flags.connect_stat.lock()
    }

    pub fn cur_prio(&self) -> i32 {
        self.inner.flags.cur_prio.load(Ordering::Relaxed)
    }

    /// True from the second successful TCP connect on.
    pub fn is_re_contact(&self) -> bool {
        self.inner.flags.is_re_contact.load(Ordering::Relaxed)
    }

    /// True from the second Normal-state negotiation on.
    pub fn is_re_connect(&self) -> bool {
        self.inner.flags.is_re_connect.load(Ordering::Relaxed)
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.shared.info.lock().is_encrypted
    }

    pub fn traffic(&self) -> (u64, u64) {
        (
            self.inner.shared.traffic_in.load(Ordering::Relaxed),
            self.inner.shared.traffic_out.load(Ordering::Relaxed),
        )
    }

    pub fn remote_who_i_am(&self) -> RecordMap {
        let raw = self.inner.shared.info.lock().remote_who_i_am.clone();
        RecordMap::from_line(&raw, crate::wire::RecOptions::default()).unwrap_or_default()
    }

    pub fn remote_allow(&self) -> Allow {
        self.inner.shared.info.lock().remote_allow
    }

    // ---- login ------------------------------------------------------------

    pub fn login(&self, user_name: &str, password: &str, allow: Allow) {
        self.login_hashed(user_name, &password_hash(password), allow);
    }

    pub fn login_hashed(&self, user_name: &str, password_hashed: &str, allow: Allow) {
        {
            let mut cfg = self.inner.host_cfg.lock();
            cfg.valid_credent = !user_name.is_empty();
            cfg.credentials =
                Some((user_name.to_string(), password_hashed.to_string(), allow));
        }
        let _ = self.inner.cmd_tx.send(SessionCmd::Login {
            user: user_name.to_string(),
            pw_hash: password_hashed.to_string(),
            allow,
        });
    }

    // ---- mount points ------------------------------------------------------

    /// Replaces all mount points with one.
    pub async fn set_mount_point(&self, local_path: &str) -> bool {
        let old: Vec<String> =
            self.inner.mounts.lock().iter().map(|(l, _)| l.clone()).collect();
        for local in old {
            self.remove_mount_point(&local).await;
        }
        self.add_mount_point(local_path, "").await
    }

    /// Shares the subtree at `local_path`, appearing at `remote_path` on
    /// the server (same path when empty).
    pub async fn add_mount_point(&self, local_path: &str, remote_path: &str) -> bool {
        let (reply, rx) = async_channel::bounded(1);
        if self
            .inner
            .cmd_tx
            .send(SessionCmd::AddMount {
                local_path: local_path.to_string(),
                remote_path: remote_path.to_string(),
                reply,
            })
            .is_err()
        {
            return false;
        }
        let ok = rx.recv().await.unwrap_or(false);
        if ok {
            let local = path::full_path(local_path);
            let remote = if remote_path.is_empty() {
                local.clone()
            } else {
                path::full_path(remote_path)
            };
            self.inner.mounts.lock().push((local, remote));
        }
        ok
    }

    pub async fn remove_mount_point(&self, local_path: &str) -> bool {
        let (reply, rx) = async_channel::bounded(1);
        if self
            .inner
            .cmd_tx
            .send(SessionCmd::RemoveMount { local_path: local_path.to_string(), reply })
            .is_err()
        {
            return false;
        }
        let ok = rx.recv().await.unwrap_or(false);
        if ok {
            let local = path::full_path(local_path);
            self.inner.mounts.lock().retain(|(l, _)| *l != local);
        }
        ok
    }

    /// The (local, remote) mount bases covering `path`.
    pub fn local_remote_of(&self, path_in: &str) -> Option<(String, String)> {
        let full = path::full_path(path_in);
        self.inner
            .mounts
            .lock()
            .iter()
            .find(|(l, _)| full.starts_with(l.as_str()))
            .cloned()
    }

    // ---- sharing -----------------------------------------------------------

    /// Explicitly shares one object over this session. Returns the net id
    /// and whether the share is new.
    pub async fn new_net_item(&self, path: &str, sync_mode: SyncMode) -> Result<(u32, bool)> {
        let (reply, rx) = async_channel::bounded(1);
        self.inner
            .cmd_tx
            .send(SessionCmd::NewNetItem { path: path.to_string(), sync_mode, reply })
            .map_err(|_| Error::new(ErrCode::ConnectionError, "client stopped"))?;
        rx.recv()
            .await
            .map_err(|_| Error::new(ErrCode::ConnectionError, "client stopped"))?
    }

    pub(crate) fn send_monitor_start(&self, net_id: u32, restart: bool) {
        let _ = self.inner.cmd_tx.send(SessionCmd::MonitorStart { net_id, restart });
    }

    // ---- commands ----------------------------------------------------------

    pub fn command_get(&self, path: &str) {
        let mut map = RecordMap::command("get");
        map.add_str("path", path);
        let _ = self.inner.cmd_tx.send(SessionCmd::SendRecord(map));
    }

    pub fn command_set(&self, path: &str, data: &str) {
        let mut map = RecordMap::command("set");
        map.add_str("path", path).add_str("data", data);
        let _ = self.inner.cmd_tx.send(SessionCmd::SendRecord(map));
    }

    pub fn command_ls(&self, path: &str) {
        let mut map = RecordMap::command("ls");
        map.add_str("path", path);
        let _ = self.inner.cmd_tx.send(SessionCmd::SendRecord(map));
    }

    pub fn command_version(&self) {
        let _ = self.inner.cmd_tx.send(SessionCmd::SendRecord(RecordMap::command("ver")));
    }

    pub fn command_info(&self, info_type: i64, data: &[u8]) {
        let mut map = RecordMap::command("info");
        map.add_num("type", info_type).add("data", data);
        let _ = self.inner.cmd_tx.send(SessionCmd::SendRecord(map));
    }

    pub fn chat_send(&self, text: &str, prio: bool) {
        let mtype =
            if prio { MessageType::ChatPrio as i64 } else { MessageType::ChatNormal as i64 };
        let _ = self
            .inner
            .cmd_tx
            .send(SessionCmd::SendMessage { mtype, data: text.as_bytes().to_vec() });
    }

    pub fn abort_kill_request(&self) {
        let _ = self.inner.cmd_tx.send(SessionCmd::SendMessage {
            mtype: MessageType::AbortKillRequest as i64,
            data: Vec::new(),
        });
    }

    // ---- client registry ---------------------------------------------------

    /// Registers this client under an id so monitors and helpers can find
    /// it by name.
    pub fn register_client(&self, id: &str) {
        let mut reg = client_registry().lock();
        reg.retain(|_, c| !Arc::ptr_eq(&c.inner, &self.inner));
        reg.insert(id.to_string(), self.clone());
        *self.inner.id.lock() = id.to_string();
    }

    pub fn get_client(id: &str) -> Option<Client> {
        client_registry().lock().get(id).cloned()
    }

    pub fn id(&self) -> String {
        self.inner.id.lock().clone()
    }
}

fn client_registry() -> &'static Mutex<HashMap<String, Client>> {
    static REG: OnceLock<Mutex<HashMap<String, Client>>> = OnceLock::new();
    REG.get_or_init(|| Mutex::new(HashMap::new()))
}

// ---- the client task -------------------------------------------------------

enum IdleStep {
    Done,
    Ctrl(Option<ClientCtrl>),
    Cmd(Option<SessionCmd>),
    Sess(Option<SessionEvent>),
}

struct ClientTask {
    core: SessionCore,
    cmd_rx: mpsc::UnboundedReceiver<SessionCmd>,
    ctrl_rx: mpsc::UnboundedReceiver<ClientCtrl>,
    sess_rx: async_channel::Receiver<SessionEvent>,
    app_tx: async_channel::Sender<ClientEvent>,
    cmd_tx: mpsc::UnboundedSender<SessionCmd>,
    host_cfg: Arc<Mutex<HostConfig>>,
    flags: Arc<ClientFlags>,
    next_host: i32,
}

impl ClientTask {
    async fn run(mut self) {
        let mut want_connect = false;

        loop {
            // Idle phase: keep serving commands and waiting for a start.
            while !want_connect {
                let step = tokio::select! {
                    ctrl = self.ctrl_rx.recv() => IdleStep::Ctrl(ctrl),
                    cmd = self.cmd_rx.recv() => IdleStep::Cmd(cmd),
                    ev = self.sess_rx.recv() => IdleStep::Sess(ev.ok()),
                };
                match step {
                    IdleStep::Ctrl(Some(ClientCtrl::Start)) => {
                        self.next_host =
                            if self.host_cfg.lock().single.is_some() { -1 } else { 0 };
                        want_connect = true;
                    }
                    IdleStep::Ctrl(None) | IdleStep::Cmd(None) => return,
                    IdleStep::Cmd(Some(cmd)) => self.core.handle_cmd(cmd).await,
                    IdleStep::Sess(Some(ev)) => self.forward(ev),
                    IdleStep::Sess(None) => {}
                    IdleStep::Done => unreachable!("Done is only produced by idle_wait's select"),
                }
            }

            if self.flags.closed.load(Ordering::Relaxed) {
                want_connect = false;
                continue;
            }

            // Pick the next host candidate.
            let pick = self.pick_host();
            let Some((host, port, prio)) = pick else {
                self.set_status(ConnectStat::TriedAll, -1);
                if self.host_cfg.lock().auto_connect {
                    let retry = self.host_cfg.lock().retry_time;
                    if !self.idle_wait(Duration::from_secs(retry as u64)).await {
                        return;
                    }
                } else {
                    want_connect = false;
                }
                continue;
            };

            self.flags.cur_prio.store(prio, Ordering::Relaxed);
            self.set_status(ConnectStat::Connecting, prio);
            self.core.connect_started();

            let tcp_host = path::host_from_host_with_info(&host);
            let stream = TcpStream::connect((tcp_host.as_str(), port)).await;
            match stream {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);

                    let was = self.flags.was_contact.swap(true, Ordering::Relaxed);
                    self.flags.is_re_contact.store(was, Ordering::Relaxed);

                    self.emit(ClientEvent::TcpConnected { host: host.clone(), port });
                    self.core.connected();
                    self.set_status(ConnectStat::Negotiating, prio);

                    let end = self.drive(NetStream::Plain(stream)).await;
                    self.core.disconnected();

                    let prev = self.connect_stat();
                    let next = match prev {
                        Some(ConnectStat::Connected)
                        | Some(ConnectStat::Stopped)
                        | Some(ConnectStat::Negotiating) => ConnectStat::Disconnected,
                        _ => ConnectStat::Error,
                    };
                    self.set_status(next, prio);
                    match (&end, next) {
                        (DriveEnd::Io(err), ConnectStat::Error) => {
                            self.emit(ClientEvent::TcpError(err.to_string()));
                        }
                        _ => self.emit(ClientEvent::TcpDisconnected),
                    }
                }
                Err(err) => {
                    self.core.registry().log_error(
                        &format!("TCP Client Msg: {}", err),
                        ErrCode::ConnectionError,
                    );
                    self.set_status(ConnectStat::Error, prio);
                    self.emit(ClientEvent::TcpError(err.to_string()));
                }
            }

            if self.flags.closed.load(Ordering::Relaxed) {
                want_connect = false;
                continue;
            }

            // Walk the list; delay once it wrapped (or for a single host).
            let wrapped = self.next_host <= 0;
            if wrapped {
                let (auto, retry) = {
                    let cfg = self.host_cfg.lock();
                    (cfg.auto_connect, cfg.retry_time)
                };
                if auto {
                    if !self.idle_wait(Duration::from_secs(retry as u64)).await {
                        return;
                    }
                } else {
                    want_connect = false;
                }
            }
        }
    }

    /// Runs the session while keeping application notifications flowing.
    async fn drive(&mut self, stream: NetStream) -> DriveEnd {
        let core = &mut self.core;
        let cmd_rx = &mut self.cmd_rx;
        let mut drive = std::pin::pin!(core.drive(stream, cmd_rx));

        loop {
            tokio::select! {
                end = drive.as_mut() => return end,
                ev = self.sess_rx.recv() => {
                    if let Ok(ev) = ev {
                        forward_event(
                            ev,
                            &self.app_tx,
                            &self.flags,
                            &self.host_cfg,
                            &self.cmd_tx,
                        );
                    }
                }
            }
        }
    }

    fn pick_host(&mut self) -> Option<(String, u16, i32)> {
        let cfg = self.host_cfg.lock();
        if let Some(single) = &cfg.single {
            return Some((single.addr.clone(), single.port, -1));
        }
        if cfg.hosts.is_empty() {
            return None;
        }
        let idx = self.next_host.max(0) as usize;
        if idx >= cfg.hosts.len() {
            self.next_host = 0;
            return None; // past the end: report tried-all, then restart
        }
        let (host, prio) = &cfg.hosts[idx];
        self.next_host += 1;
        Some((host.addr.clone(), host.port, *prio))
    }

    /// Waits, still serving session commands and events. Returns false
    /// when the owning client is gone and the task should stop.
    async fn idle_wait(&mut self, dur: Duration) -> bool {
        let sleep = tokio::time::sleep(dur);
        tokio::pin!(sleep);
        loop {
            let step = tokio::select! {
                _ = sleep.as_mut() => IdleStep::Done,
                cmd = self.cmd_rx.recv() => IdleStep::Cmd(cmd),
                ev = self.sess_rx.recv() => IdleStep::Sess(ev.ok()),
                ctrl = self.ctrl_rx.recv() => IdleStep::Ctrl(ctrl),
            };
            match step {
                IdleStep::Done => return true,
                IdleStep::Cmd(Some(cmd)) => self.core.handle_cmd(cmd).await,
                IdleStep::Cmd(None) => return false,
                IdleStep::Sess(Some(ev)) => self.forward(ev),
                IdleStep::Sess(None) => {}
                IdleStep::Ctrl(None) => return false,
                IdleStep::Ctrl(Some(ClientCtrl::Start)) => {
                    // A new start request cuts the wait short.
                    self.next_host = if self.host_cfg.lock().single.is_some() { -1 } else { 0 };
                    return true;
                }
            }
        }
    }

    fn forward(&self, ev: SessionEvent) {
        forward_event(ev, &self.app_tx, &self.flags, &self.host_cfg, &self.cmd_tx);
    }

    fn emit(&self, ev: ClientEvent) {
        let _ = self.app_tx.try_send(ev);
    }

    fn connect_stat(&self) -> Option<ConnectStat> {
        *self.flags.connect_stat.lock()
    }

    fn set_status(&self, stat: ConnectStat, prio: i32) {
        *self.flags.connect_stat.lock() = Some(stat);
        self.emit(ClientEvent::ConnectionStatus { stat, prio });
    }
}

/// Translates session events to client events, handling auto-login and
/// the connect/re-connect bookkeeping.
fn forward_event(
    ev: SessionEvent,
    app_tx: &async_channel::Sender<ClientEvent>,
    flags: &ClientFlags,
    host_cfg: &Mutex<HostConfig>,
    cmd_tx: &mpsc::UnboundedSender<SessionCmd>,
) {
    let emit = |ev: ClientEvent| {
        let _ = app_tx.try_send(ev);
    };

    match ev {
        SessionEvent::StateChanged(state) => {
            if state == SyncState::Normal {
                let was = flags.was_connect.swap(true, Ordering::Relaxed);
                flags.is_re_connect.store(was, Ordering::Relaxed);
                *flags.connect_stat.lock() = Some(ConnectStat::Connected);
                emit(ClientEvent::ConnectionStatus {
                    stat: ConnectStat::Connected,
                    prio: flags.cur_prio.load(Ordering::Relaxed),
                });
            }
            emit(ClientEvent::SyncStateChanged(state));
        }
        SessionEvent::LoginRequired(reason) => {
            let try_stored = {
                let cfg = host_cfg.lock();
                cfg.valid_credent && reason == LoginReason::FirstTry
            };
            if try_stored {
                let creds = host_cfg.lock().credentials.clone();
                if let Some((user, pw_hash, allow)) = creds {
                    let _ = cmd_tx.send(SessionCmd::Login { user, pw_hash, allow });
                    return;
                }
            }
            host_cfg.lock().valid_credent = false;
            emit(ClientEvent::LoginRequired(reason));
        }
        SessionEvent::LoginCompleted { user } => emit(ClientEvent::LoginCompleted { user }),
        SessionEvent::Reply(map) => forward_reply(map, emit),
        SessionEvent::Message { mtype, data } => match MessageType::from_i64(mtype) {
            Some(MessageType::KillRequest) => {
                emit(ClientEvent::KillRequested);
                let _ = cmd_tx.send(SessionCmd::Close);
            }
            Some(MessageType::ChatPrio) => emit(ClientEvent::ChatReceived {
                text: String::from_utf8_lossy(&data).into_owned(),
                prio: true,
            }),
            Some(MessageType::ChatNormal) => emit(ClientEvent::ChatReceived {
                text: String::from_utf8_lossy(&data).into_owned(),
                prio: false,
            }),
            _ => {}
        },
        SessionEvent::DeletePath(_) => {}
        SessionEvent::InfoReceived(_) => {}
        SessionEvent::HeartBeatChanged(ok) => {
            let prio = flags.cur_prio.load(Ordering::Relaxed);
            let mut stat = flags.connect_stat.lock();
            if !ok && *stat == Some(ConnectStat::Connected) {
                *stat = Some(ConnectStat::Stopped);
                drop(stat);
                emit(ClientEvent::ConnectionStatus { stat: ConnectStat::Stopped, prio });
            } else if ok && *stat == Some(ConnectStat::Stopped) {
                *stat = Some(ConnectStat::Connected);
                drop(stat);
                emit(ClientEvent::ConnectionStatus { stat: ConnectStat::Connected, prio });
            }
            emit(ClientEvent::HeartBeatChanged(ok));
        }
    }
}

fn forward_reply(map: RecordMap, emit: impl Fn(ClientEvent)) {
    match map.command_word() {
        b"Rget" => emit(ClientEvent::ReplyGet {
            data: map.value_or("data", b"").to_vec(),
            path: map.value_string("path"),
        }),
        b"Rls" => {
            let n = map.max_enum_of("item");
            let items = (1..=n)
                .filter_map(|i| map.value_enum("item", i))
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .collect();
            emit(ClientEvent::ReplyLs { items, path: map.value_string("path") });
        }
        b"Rinfo" => emit(ClientEvent::ReplyInfo {
            info_type: map.value_num("type", -1),
            data: map.value_or("data", b"").to_vec(),
        }),
        b"Rver" => {
            let ver = map.value_string("ver");
            let rtype = map.value_string("type");
            let ver = if ver.is_empty() { "1.0".to_string() } else { ver };
            let rtype = if rtype.is_empty() { super::SYNC_TYPE.to_string() } else { rtype };
            emit(ClientEvent::ReplyVer { text: format!("{} ver {}", rtype, ver) });
        }
        _ => {}
    }
}
