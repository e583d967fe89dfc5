//! The per-connection protocol state machine.
//!
//! A [`SessionCore`] carries everything one connection needs: the id → net
//! handle map, the four send queues, negotiation and login state, and the
//! queued event intake its handles feed. The owning task (client or server
//! side) drives it: socket bytes go in through [`SessionCore::feed`], link
//! events through [`SessionCore::drain_intake`], and outbound records are
//! taken with [`SessionCore::take_out`] and written to the socket.
//!
//! Queue fairness: pending `sync` records drain first, then `mode`
//! records, then the two flux queues merged by ascending queue number so
//! leaves and pipes keep their source order against each other.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use super::net_handle::NetHandle;
use super::pattern::pattern_match;
use super::stream::{NetStream, TlsConfig};
use super::{
    atomic_op_from_wire, atomic_op_to_wire, check_encrypt_policy, Allow, ClientSyncMode,
    EncryptPolicy, InfoType, LoginReason, MessageType, SyncState, SYNC_TYPE, SYNC_VERSION,
    SYNC_VERSION_MAJOR,
};
use crate::error::ErrCode;
use crate::event::{EventIntake, LinkEvent, MonEvent, WriteMeta};
use crate::handle::{Handle, HandleCore};
use crate::mode::{LinkFlags, RetireKind, SyncMode};
use crate::path;
use crate::registry::Registry;
use crate::sync::login::{pw_hash_xchg, LoginTable};
use crate::value::DataType;
use crate::wire::{LineDecoder, RecOptions, RecordMap};
use num_traits::FromPrimitive;

static SESSION_TAG: AtomicU64 = AtomicU64::new(1);

const LOGIN_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Textual payload of a queued flux record, without the export-code tag.
fn flux_payload_text(map: &RecordMap) -> String {
    let data = map.value_or("data", b"");
    let data = match data.first() {
        Some(&b) if b < 32 => &data[1..],
        _ => data,
    };
    String::from_utf8_lossy(data).into_owned()
}

/// Notifications a session surfaces to its owner.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SyncState),
    LoginRequired(LoginReason),
    LoginCompleted { user: String },
    /// Any `R...` reply record, verbatim.
    Reply(RecordMap),
    Message { mtype: i64, data: Vec<u8> },
    /// A `delete` record naming a path (tree delete from the peer).
    DeletePath(String),
    InfoReceived(i64),
    HeartBeatChanged(bool),
}

/// Counters and metadata shared with the owning client/server object.
#[derive(Default)]
pub struct SessionShared {
    pub traffic_in: AtomicU64,
    pub traffic_out: AtomicU64,
    pub info: Mutex<SessionInfo>,
}

#[derive(Default, Clone)]
pub struct SessionInfo {
    pub state_normal: bool,
    pub is_encrypted: bool,
    pub remote_ver: [u32; 2],
    pub remote_who_i_am: Vec<u8>,
    pub login_user: String,
    pub allow: Allow,
    pub remote_allow: Allow,
}

/// Commands from the owning application object into the session task.
pub(crate) enum SessionCmd {
    Login { user: String, pw_hash: String, allow: Allow },
    SendMessage { mtype: i64, data: Vec<u8> },
    SendRecord(RecordMap),
    NewNetItem {
        path: String,
        sync_mode: SyncMode,
        reply: async_channel::Sender<crate::error::Result<(u32, bool)>>,
    },
    /// Kick off a monitor on an already-synced net item.
    MonitorStart { net_id: u32, restart: bool },
    AddMount {
        local_path: String,
        remote_path: String,
        reply: async_channel::Sender<bool>,
    },
    RemoveMount { local_path: String, reply: async_channel::Sender<bool> },
    Close,
}

struct FluxRec {
    map: RecordMap,
    queue_num: i64,
}

struct MountPoint {
    handle: Handle,
    local_path: String,
    remote_path: String,
}

/// Everything decided at session construction.
pub(crate) struct SessionConfig {
    pub is_client: bool,
    pub demand_login: bool,
    pub encrypt_policy: EncryptPolicy,
    pub client_sync_mode: ClientSyncMode,
    pub who_i_am: Vec<u8>,
    pub login_table: Option<Arc<LoginTable>>,
    pub receive_timeout: u32,
    pub tls: Option<TlsConfig>,
}

impl SessionConfig {
    pub fn client() -> SessionConfig {
        SessionConfig {
            is_client: true,
            demand_login: false,
            encrypt_policy: EncryptPolicy::PreferNo,
            client_sync_mode: ClientSyncMode::StdAutoMaster,
            who_i_am: Vec::new(),
            login_table: None,
            receive_timeout: 10,
            tls: None,
        }
    }

    pub fn server() -> SessionConfig {
        SessionConfig {
            is_client: false,
            demand_login: false,
            encrypt_policy: EncryptPolicy::PreferNo,
            client_sync_mode: ClientSyncMode::Invalid,
            who_i_am: Vec::new(),
            login_table: None,
            receive_timeout: 10,
            tls: None,
        }
    }
}

/// How a driven connection ended.
#[derive(Debug)]
pub(crate) enum DriveEnd {
    PeerClosed,
    Aborted,
    Io(std::io::Error),
}

pub(crate) struct SessionCore {
    registry: Registry,
    cfg: SessionConfig,
    session_tag: u64,
    shared: Arc<SessionShared>,
    events: Option<async_channel::Sender<SessionEvent>>,

    state: SyncState,
    cur_info: InfoType,
    decoder: LineDecoder,
    rec_opts: RecOptions,

    items: HashMap<u32, NetHandle>,
    by_handle: HashMap<u32, u32>,
    mounts: Vec<MountPoint>,
    intake: Arc<EventIntake>,

    sync_queue: VecDeque<u32>,
    mode_queue: VecDeque<u32>,
    flux_item_queue: VecDeque<u32>,
    flux_pipe_queue: VecDeque<FluxRec>,
    queue_num_count: i64,
    queue_num_done: i64,

    out: VecDeque<Vec<u8>>,
    wants_disconnect: bool,
    pending_tls: Option<bool>,

    is_connect_started: bool,
    is_connected: bool,
    is_closed: bool,
    is_encrypted: bool,
    need_encrypted: bool,

    remote_ver: [u32; 2],
    remote_encrypt_pol: EncryptPolicy,
    allow: Allow,
    remote_allow: Allow,
    free_paths: Vec<String>,
    remote_who_i_am: Vec<u8>,

    login_next_seq: i32,
    login_reason: LoginReason,
    login_salt1: u32,
    login_salt2: u32,
    login_user: String,
    login_pw_hash: String,
    login_delay_until: Option<Instant>,

    last_rx: Instant,
    last_tx: Instant,
    keepalive_sent: bool,
    heart_beat_ok: bool,
}

impl SessionCore {
    pub fn new(registry: Registry, cfg: SessionConfig) -> SessionCore {
        let is_client = cfg.is_client;
        let mut free_paths = Vec::new();
        if !is_client {
            free_paths.push(path::full_path(&format!("{}{}", path::PATH_LOCAL_SYS, "Legal/")));
        }

        SessionCore {
            registry,
            session_tag: SESSION_TAG.fetch_add(1, Ordering::Relaxed),
            shared: Arc::new(SessionShared::default()),
            events: None,

            state: SyncState::Init,
            cur_info: InfoType::Start,
            decoder: LineDecoder::new(),
            rec_opts: RecOptions::default(),

            items: HashMap::new(),
            by_handle: HashMap::new(),
            mounts: Vec::new(),
            intake: EventIntake::new(),

            sync_queue: VecDeque::new(),
            mode_queue: VecDeque::new(),
            flux_item_queue: VecDeque::new(),
            flux_pipe_queue: VecDeque::new(),
            queue_num_count: 0,
            queue_num_done: 0,

            out: VecDeque::new(),
            wants_disconnect: false,
            pending_tls: None,

            is_connect_started: !is_client,
            is_connected: !is_client,
            is_closed: is_client,
            is_encrypted: false,
            need_encrypted: cfg.encrypt_policy == EncryptPolicy::MustHave,

            remote_ver: [1, 0],
            remote_encrypt_pol: EncryptPolicy::Refuse,
            allow: if is_client { Allow::all() } else { Allow::empty() },
            // A client has no restriction knowledge until the server
            // announces its permissions.
            remote_allow: if is_client { Allow::all() } else { Allow::empty() },
            free_paths,
            remote_who_i_am: Vec::new(),

            login_next_seq: 0,
            login_reason: LoginReason::FirstTry,
            login_salt1: 0,
            login_salt2: 0,
            login_user: String::new(),
            login_pw_hash: String::new(),
            login_delay_until: None,

            last_rx: Instant::now(),
            last_tx: Instant::now(),
            keepalive_sent: false,
            heart_beat_ok: true,

            cfg,
        }
    }

    pub fn shared(&self) -> Arc<SessionShared> {
        self.shared.clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn set_events(&mut self, tx: async_channel::Sender<SessionEvent>) {
        self.events = Some(tx);
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn add_free_path(&mut self, path: &str) {
        let full = path::full_path(path);
        if !self.free_paths.contains(&full) {
            self.free_paths.push(full);
        }
    }

    fn emit(&self, ev: SessionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.try_send(ev);
        }
    }

    fn push_info(&self) {
        let mut info = self.shared.info.lock();
        info.state_normal = self.state == SyncState::Normal;
        info.is_encrypted = self.is_encrypted;
        info.remote_ver = self.remote_ver;
        info.remote_who_i_am = self.remote_who_i_am.clone();
        info.login_user = self.login_user.clone();
        info.allow = self.allow;
        info.remote_allow = self.remote_allow;
    }

    fn set_state(&mut self, state: SyncState) {
        if state == self.state {
            return;
        }
        self.state = state;
        self.push_info();
        self.emit(SessionEvent::StateChanged(state));
    }

    // ---- lifecycle ------------------------------------------------------

    /// Server side: socket accepted, start the session.
    pub fn start_server(&mut self) {
        if self.cfg.demand_login || self.cfg.login_table.as_ref().is_some_and(|t| !t.is_empty()) {
            self.cfg.demand_login = true;
            self.allow = Allow::empty();
            self.remote_allow = Allow::empty();
        } else {
            self.allow = Allow::all();
            self.remote_allow = Allow::all();
            self.set_state(SyncState::Normal);
        }
    }

    /// Client side: connect attempt started; first one after a close
    /// clears every queue.
    pub fn connect_started(&mut self) {
        if !self.is_connect_started {
            self.is_connect_started = true;
            self.clear_all_queues();
        }
    }

    /// Client side: TCP is up, begin version negotiation.
    pub fn connected(&mut self) {
        self.is_closed = false;
        self.is_connected = true;
        self.remote_allow = Allow::empty();
        self.remote_encrypt_pol = EncryptPolicy::Refuse;
        self.need_encrypted = false;
        self.rec_opts = RecOptions::default();
        self.decoder = LineDecoder::new();
        self.out.clear();
        self.wants_disconnect = false;
        self.pending_tls = None;
        self.cur_info = InfoType::Start;
        self.last_rx = Instant::now();
        self.keepalive_sent = false;
        self.login_next_seq = 0;
        self.login_reason = LoginReason::FirstTry;

        self.set_state(SyncState::Version);
        let mut map = RecordMap::command("ver");
        map.add_str("type", SYNC_TYPE).add_str("ver", SYNC_VERSION);
        self.send(&map);
    }

    /// Socket gone. The client keeps its items armed for re-sync; the
    /// server destroys auto-destroy items and is done.
    pub fn disconnected(&mut self) {
        self.is_connected = false;
        self.is_encrypted = false;
        self.set_state(SyncState::Init);

        if self.cfg.is_client {
            if self.is_closed {
                self.clear_all_queues();
            }
            for item in self.items.values_mut() {
                item.on_connect_stop();
            }
        } else {
            let destroy_list: Vec<u32> = self
                .items
                .iter()
                .filter(|(_, item)| item.item.is_auto_destroy())
                .map(|(id, _)| *id)
                .collect();
            for net_id in destroy_list {
                if let Some(item) = self.items.get(&net_id) {
                    item.item.destroy(true);
                }
            }
        }
    }

    pub fn close(&mut self) {
        self.is_connect_started = false;
        if self.is_closed {
            return;
        }
        self.is_closed = true;
        if !self.is_connected {
            self.clear_all_queues();
        }
    }

    fn close_final(&mut self) {
        self.send(&RecordMap::command("exit"));
        self.wants_disconnect = true;
    }

    fn clear_non_pipe_queues(&mut self) {
        self.sync_queue.clear();
        self.mode_queue.clear();
        self.flux_item_queue.clear();
    }

    fn clear_all_queues(&mut self) {
        self.clear_non_pipe_queues();
        self.flux_pipe_queue.clear();
    }

    // ---- outbound plumbing ----------------------------------------------

    fn send(&mut self, map: &RecordMap) {
        if !self.is_connected {
            return;
        }
        let bytes = map.to_wire(self.rec_opts);
        tracing::trace!(rec = %String::from_utf8_lossy(&map.to_line(RecOptions::default())), "rec out");
        self.shared.traffic_out.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.last_tx = Instant::now();
        self.out.push_back(bytes);
    }

    pub fn take_out(&mut self) -> Option<Vec<u8>> {
        self.out.pop_front()
    }

    fn take_pending_tls(&mut self) -> Option<bool> {
        self.pending_tls.take()
    }

    fn set_encrypted(&mut self) {
        self.is_encrypted = true;
        self.push_info();
    }

    /// Client side: TLS handshake done, resume the info chain.
    fn on_encrypted(&mut self) {
        if self.cfg.is_client {
            self.do_info_internal(InfoType::EncryptRdy as i64, &[]);
        }
    }

    // ---- inbound --------------------------------------------------------

    /// Feeds received bytes and processes every complete record in them.
    pub async fn feed(&mut self, data: &[u8]) {
        self.shared.traffic_in.fetch_add(data.len() as u64, Ordering::Relaxed);
        self.last_rx = Instant::now();
        self.keepalive_sent = false;
        if !self.heart_beat_ok {
            self.heart_beat_ok = true;
            self.emit(SessionEvent::HeartBeatChanged(true));
        }
        if self.is_closed {
            return;
        }

        self.decoder.feed(data);
        loop {
            match self.decoder.next_record() {
                Ok(Some(payload)) => self.process_payload(&payload).await,
                Ok(None) => break,
                Err(err) => {
                    self.registry.log_error(&err.to_string(), ErrCode::RecUnknown);
                    self.wants_disconnect = true;
                    break;
                }
            }
        }
    }

    async fn process_payload(&mut self, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        if payload[0] == b'"' {
            // Quoted text line, bypasses the map parser.
            let text = String::from_utf8_lossy(&payload[1..]).into_owned();
            self.emit(SessionEvent::Message {
                mtype: MessageType::ChatNormal as i64,
                data: text.into_bytes(),
            });
            return;
        }

        let map = match RecordMap::from_line(payload, self.rec_opts) {
            Ok(map) => map,
            Err(err) => {
                let mut reply = RecordMap::command("err");
                reply.add_str("data", &format!("malformed record: {}", err));
                reply.add_num("stat", ErrCode::RecUnknown as i64);
                self.send(&reply);
                return;
            }
        };
        tracing::trace!(rec = %String::from_utf8_lossy(payload), "rec in");
        self.process_record(map).await;
    }

    async fn process_record(&mut self, map: RecordMap) {
        let command = map.command_word().to_vec();

        if self.need_encrypted
            && !self.is_encrypted
            && !matches!(command.as_slice(), b"ver" | b"Rver" | b"info" | b"Rinfo" | b"exit")
        {
            let mut reply = RecordMap::command("err");
            reply.add_str("data", "record before encryption");
            reply.add_num("stat", ErrCode::NeedEncrypted as i64);
            self.send(&reply);
            return;
        }

        let stat = match command.as_slice() {
            b"flux" => self.do_command_flux(&map),
            b"atomop" => self.do_command_atom_op(&map),
            b"event" => self.do_command_event(&map),
            b"get" => self.do_command_get(&map).await,
            b"set" => self.do_command_set(&map).await,
            b"sync" => self.do_command_sync(&map).await,
            b"mode" => self.do_command_mode(&map),
            b"nosync" => self.do_command_no_sync(&map),
            b"delete" | b"destroy" => self.do_command_delete(&map),
            b"message" => self.do_command_message(&map),
            b"ls" => self.do_command_ls(&map).await,
            b"info" => self.do_command_info(&map),
            b"Rinfo" => self.do_command_r_info(&map),
            b"ver" => self.do_command_ver(&map),
            b"Rver" => self.do_command_r_ver(&map),
            b"login" => self.do_command_login(&map),
            b"$heartbeat" => {
                self.send(&RecordMap::command("R$heartbeat"));
                ErrCode::Ok
            }
            b"exit" => {
                self.wants_disconnect = true;
                ErrCode::Ok
            }
            b"err" => {
                tracing::warn!(rec = %String::from_utf8_lossy(&map.to_line(RecOptions::default())), "err record");
                ErrCode::Ok
            }
            cmd if cmd.first() == Some(&b'R') => ErrCode::Ok, // unhandled replies are fine
            cmd => {
                let mut reply = RecordMap::command("err");
                reply.add("data", &[b"Unknown record:", cmd].concat());
                reply.add_num("stat", ErrCode::RecUnknown as i64);
                self.send(&reply);
                ErrCode::Ok // the reply already carries the status
            }
        };

        if command.first() == Some(&b'R') {
            self.emit(SessionEvent::Reply(map));
        }

        if stat != ErrCode::Ok {
            let mut reply = RecordMap::command("err");
            reply.add("data", &[b"record:".as_slice(), &command].concat());
            reply.add_num("stat", stat as i64);
            self.send(&reply);
        }
    }

    // ---- version / info -------------------------------------------------

    fn set_remote_ver(&mut self, ver: &[u8]) {
        if ver.is_empty() {
            return;
        }
        self.remote_ver = [1, 0];
        for (i, part) in ver.split(|&b| b == b'.').take(2).enumerate() {
            self.remote_ver[i] =
                std::str::from_utf8(part).ok().and_then(|s| s.parse().ok()).unwrap_or(0);
        }
        self.rec_opts = RecOptions::for_version(self.remote_ver[0].min(SYNC_VERSION_MAJOR));
        self.push_info();
    }

    fn do_command_ver(&mut self, map: &RecordMap) -> ErrCode {
        if self.cfg.is_client {
            return ErrCode::RecNotExpected;
        }

        if self.state == SyncState::Init {
            self.set_remote_ver(map.value_or("ver", b"1.0"));
            if self.need_encrypted && self.remote_ver[0] < 5 {
                self.send_message(
                    MessageType::ChatPrio as i64,
                    b"server deny, encryption policy not satisfied",
                );
                self.send_message(MessageType::KillRequest as i64, &[]);
            } else if self.remote_ver[0] >= 2 {
                self.set_state(SyncState::Login);
            } else {
                self.set_state(SyncState::Normal);
            }
        } else {
            self.set_remote_ver(map.value_or("ver", b""));
        }

        let mut reply = RecordMap::command("Rver");
        reply.add_str("type", SYNC_TYPE).add_str("ver", SYNC_VERSION);
        self.send(&reply);
        ErrCode::Ok
    }

    fn do_command_r_ver(&mut self, map: &RecordMap) -> ErrCode {
        if !self.cfg.is_client {
            return ErrCode::RecNotExpected;
        }

        if self.state == SyncState::Version {
            self.set_remote_ver(map.value_or("ver", b"1.0"));
            if self.remote_ver[0] >= 2 {
                self.set_state(SyncState::Info);
                self.cur_info = InfoType::Start;
                self.do_info_internal(InfoType::Start as i64, &[]);
            } else if !self.cfg.demand_login {
                // Legacy server without login support.
                self.remote_allow = Allow::all();
                self.start_normal_sync();
            } else {
                self.set_state(SyncState::Login);
                self.emit(SessionEvent::LoginRequired(LoginReason::NoLoginSupport));
            }
        }
        ErrCode::Ok
    }

    fn send_info(&mut self, info_type: i64, data: &[u8]) {
        let mut map = RecordMap::command("info");
        map.add_num("type", info_type).add("data", data);
        self.send(&map);
    }

    pub fn send_message(&mut self, mtype: i64, data: &[u8]) {
        let mut map = RecordMap::command("message");
        map.add_num("type", mtype).add("data", data);
        self.send(&map);
    }

    fn do_command_info(&mut self, map: &RecordMap) -> ErrCode {
        if self.cfg.is_client {
            return ErrCode::RecNotExpected;
        }

        let info_type = map.value_num("type", -1);
        let data = map.value_or("data", b"").to_vec();

        let xm_in = RecordMap::from_line(&data, self.rec_opts).unwrap_or_default();
        let mut xm_out = RecordMap::new();

        match InfoType::from_i64(info_type) {
            Some(InfoType::EncryptAsk) => {
                self.remote_encrypt_pol =
                    EncryptPolicy::from_i64(xm_in.value_num("encryptPol", 0)).unwrap_or_default();
                xm_out.add_num("encryptPol", self.cfg.encrypt_policy as i64);
                if let Some(need) = check_encrypt_policy(self.cfg.encrypt_policy, self.remote_encrypt_pol)
                {
                    self.need_encrypted = need && self.cfg.tls.is_some();
                }
            }
            Some(InfoType::EncryptReq) => {
                let client_encrypt = xm_in.value_num("encrypt", 0) != 0;
                xm_out.add_num("encrypt", self.need_encrypted as i64);
                if client_encrypt && self.need_encrypted {
                    self.pending_tls = Some(true);
                }
            }
            Some(InfoType::FreePaths) => {
                xm_out.add_values(self.free_paths.iter());
            }
            Some(InfoType::WhoIAm) => {
                self.remote_who_i_am = data.clone();
                self.push_info();
                xm_out = RecordMap::from_line(&self.cfg.who_i_am, RecOptions::default())
                    .unwrap_or_default();
            }
            _ => {
                // Unsupported info type: reply empty so the client's
                // negotiation chain is not broken by future versions.
            }
        }

        self.emit(SessionEvent::InfoReceived(info_type));

        let mut reply = RecordMap::command("Rinfo");
        reply.add_num("type", info_type);
        reply.add("data", &xm_out.to_line(self.rec_opts));
        self.send(&reply);
        ErrCode::Ok
    }

    fn do_command_r_info(&mut self, map: &RecordMap) -> ErrCode {
        if !self.cfg.is_client {
            return ErrCode::RecNotExpected;
        }

        if self.state == SyncState::Info {
            let info_type = map.value_num("type", -1);
            let data = map.value_or("data", b"").to_vec();
            self.do_info_internal(info_type, &data);
            self.emit(SessionEvent::InfoReceived(info_type));
        }
        ErrCode::Ok
    }

    /// Client-side info chain: Start → (EncryptAsk → EncryptReq →
    /// EncryptRdy) → FreePaths → WhoIAm → Login.
    fn do_info_internal(&mut self, info_type: i64, data: &[u8]) {
        let xm_in = RecordMap::from_line(data, self.rec_opts).unwrap_or_default();
        let mut xm_out = RecordMap::new();

        if InfoType::from_i64(info_type) != Some(self.cur_info) {
            self.emit(SessionEvent::LoginRequired(LoginReason::BadSequence));
            return;
        }

        match self.cur_info {
            InfoType::Start => {
                if self.remote_ver[0] >= 5 {
                    self.set_state(SyncState::Info);
                    self.cur_info = InfoType::EncryptAsk;
                    xm_out.add_num("encryptPol", self.cfg.encrypt_policy as i64);
                    let line = xm_out.to_line(self.rec_opts);
                    self.send_info(InfoType::EncryptAsk as i64, &line);
                } else if check_encrypt_policy(self.cfg.encrypt_policy, self.remote_encrypt_pol)
                    .is_some()
                {
                    self.cur_info = InfoType::FreePaths;
                    self.send_info(InfoType::FreePaths as i64, &[]);
                } else {
                    self.emit(SessionEvent::LoginRequired(LoginReason::EncryptMismatch));
                }
            }
            InfoType::EncryptAsk => {
                self.remote_encrypt_pol =
                    EncryptPolicy::from_i64(xm_in.value_num("encryptPol", 0)).unwrap_or_default();
                match check_encrypt_policy(self.cfg.encrypt_policy, self.remote_encrypt_pol) {
                    Some(need) => {
                        self.need_encrypted = need;
                        if need {
                            self.cur_info = InfoType::EncryptReq;
                            xm_out.add_num("encrypt", 1);
                            let line = xm_out.to_line(self.rec_opts);
                            self.send_info(InfoType::EncryptReq as i64, &line);
                        } else {
                            self.cur_info = InfoType::FreePaths;
                            self.send_info(InfoType::FreePaths as i64, &[]);
                        }
                    }
                    None => self.emit(SessionEvent::LoginRequired(LoginReason::EncryptMismatch)),
                }
            }
            InfoType::EncryptReq => {
                let server_encrypt = xm_in.value_num("encrypt", 0) != 0;
                if server_encrypt && self.need_encrypted {
                    self.cur_info = InfoType::EncryptRdy;
                    self.pending_tls = Some(false);
                } else {
                    self.emit(SessionEvent::LoginRequired(LoginReason::EncryptMismatch));
                }
            }
            InfoType::EncryptRdy => {
                self.cur_info = InfoType::FreePaths;
                self.send_info(InfoType::FreePaths as i64, &[]);
            }
            InfoType::FreePaths => {
                self.free_paths = xm_in
                    .values()
                    .into_iter()
                    .map(|v| String::from_utf8_lossy(&v).into_owned())
                    .collect();
                self.cur_info = InfoType::WhoIAm;
                let who = self.cfg.who_i_am.clone();
                self.send_info(InfoType::WhoIAm as i64, &who);
            }
            InfoType::WhoIAm => {
                self.remote_who_i_am = data.to_vec();
                self.push_info();
                self.set_state(SyncState::Login);
                self.login_reason = LoginReason::FirstTry;
                self.start_login();
            }
        }
    }

    // ---- login ----------------------------------------------------------

    /// Client side: open the login handshake with a fresh salt.
    fn start_login(&mut self) {
        self.login_salt1 = rand::random();
        let mut xsm = RecordMap::new();
        xsm.add_num("demand", self.cfg.demand_login as i64);
        xsm.add_num("salt1", self.login_salt1 as i64);
        self.send_login(0, &xsm);
        self.login_next_seq = 1;
    }

    /// Client side, driven by the application when credentials are known.
    pub fn login_to(&mut self, user: &str, pw_hash: &str, allow: Allow) {
        self.login_user = user.to_string();
        self.login_pw_hash = pw_hash.to_string();
        self.allow = allow;
        self.continue_login();
    }

    fn continue_login(&mut self) {
        if self.login_user.is_empty() {
            return;
        }
        if self.login_next_seq != -2 {
            return; // not at the credential step
        }
        let pw_x = pw_hash_xchg(self.login_salt1, self.login_salt2, &self.login_pw_hash);
        let mut xsm = RecordMap::new();
        xsm.add_str("user", &self.login_user);
        xsm.add_str("pass", &pw_x);
        self.send_login(2, &xsm);
        self.login_next_seq = 3;
    }

    fn send_login(&mut self, seq: i64, xsm: &RecordMap) {
        let mut map = RecordMap::command("login");
        map.add_num("seq", seq);
        map.add_map(xsm);
        self.send(&map);
    }

    /// Server side: answer seq 0 with our salt. Delayed on retries.
    fn do_login_seq0_end(&mut self) {
        self.login_delay_until = None;
        self.login_salt2 = rand::random();
        let mut xsm = RecordMap::new();
        xsm.add_num("demand", self.cfg.demand_login as i64);
        xsm.add_num("salt2", self.login_salt2 as i64);
        self.send_login(1, &xsm);
        self.login_next_seq = 2;
    }

    fn do_command_login(&mut self, map: &RecordMap) -> ErrCode {
        if self.cfg.is_client && self.state != SyncState::Login {
            return ErrCode::LoginBad;
        }

        let seq = map.value_num("seq", 0);
        if seq != 0 && seq != self.login_next_seq as i64 {
            return ErrCode::LoginBad;
        }

        match seq {
            0 => {
                if self.cfg.is_client {
                    return ErrCode::LoginBad;
                }
                self.login_salt1 = map.value_num("salt1", 0) as u32;
                if self.login_next_seq == 0 {
                    self.do_login_seq0_end();
                } else {
                    // Login retry: delay to slow down guessing.
                    self.login_next_seq = -1;
                    self.login_delay_until = Some(Instant::now() + LOGIN_RETRY_DELAY);
                }
            }
            1 => {
                if !self.cfg.is_client {
                    return ErrCode::LoginBad;
                }
                self.login_salt2 = map.value_num("salt2", 0) as u32;
                let remote_demand = map.value_num("demand", 0) != 0;
                if self.cfg.demand_login || remote_demand {
                    self.login_next_seq = -2; // wait for the application
                    self.remote_allow = Allow::empty();
                    let reason = self.login_reason;
                    self.emit(SessionEvent::LoginRequired(reason));
                } else {
                    self.remote_allow = Allow::all();
                    self.start_normal_sync();
                    self.login_next_seq = -1;
                }
            }
            2 => {
                if self.cfg.is_client {
                    return ErrCode::LoginBad;
                }
                let user = map.value_string("user");
                let pass_client = map.value_string("pass");
                self.login_user = user.clone();

                let mut stat = 0;
                let mut pass_server = String::new();
                self.allow = Allow::empty();
                if let Some(entry) =
                    self.cfg.login_table.as_ref().and_then(|t| t.find_access(&user))
                {
                    let expect = pw_hash_xchg(self.login_salt1, self.login_salt2, &entry.pw_hash);
                    if pass_client == expect {
                        self.allow = entry.allow;
                        pass_server =
                            pw_hash_xchg(self.login_salt2, self.login_salt1, &entry.pw_hash);
                        stat = 1;
                    }
                }
                self.push_info();

                let mut xsm = RecordMap::new();
                xsm.add_num("stat", stat);
                xsm.add_num("allow", self.allow.to_bits_i64());
                xsm.add_str("pass", &pass_server);
                self.send_login(3, &xsm);
                self.login_next_seq = 4;
            }
            3 => {
                if !self.cfg.is_client {
                    return ErrCode::LoginBad;
                }
                let stat_server = map.value_num("stat", 0);
                self.remote_allow = Allow::from_bits_i64(map.value_num("allow", 0));
                let pass_server = map.value_string("pass");

                let expect = pw_hash_xchg(self.login_salt2, self.login_salt1, &self.login_pw_hash);
                let mut stat = 0;
                if stat_server == 0 {
                    self.login_reason = LoginReason::ServerDeny;
                } else if pass_server != expect {
                    self.login_reason = LoginReason::ClientDenyBadServer;
                } else {
                    stat = 1;
                }

                let mut xsm = RecordMap::new();
                xsm.add_num("stat", stat);
                xsm.add_num("allow", if stat != 0 { self.allow.to_bits_i64() } else { 0 });
                self.send_login(4, &xsm);
                self.login_next_seq = -1;

                if stat != 0 {
                    let user = self.login_user.clone();
                    self.push_info();
                    self.emit(SessionEvent::LoginCompleted { user });
                    self.start_normal_sync();
                } else {
                    self.start_login();
                }
            }
            4 => {
                if self.cfg.is_client {
                    return ErrCode::LoginBad;
                }
                let stat = map.value_num("stat", 0);
                self.remote_allow = Allow::from_bits_i64(map.value_num("allow", 0));
                self.login_next_seq = -1;
                self.push_info();

                if stat != 0 {
                    let user = self.login_user.clone();
                    self.emit(SessionEvent::LoginCompleted { user });
                    self.set_state(SyncState::Normal);
                }
            }
            _ => {}
        }
        ErrCode::Ok
    }

    // ---- initial sync ---------------------------------------------------

    /// Client side: entering Normal, every existing net item is re-synced.
    fn start_normal_sync(&mut self) {
        if self.state == SyncState::Normal {
            return;
        }

        self.clear_non_pipe_queues();

        let net_ids: Vec<u32> = self.items.keys().copied().collect();
        for net_id in net_ids {
            let (push_value, mode_pending) = {
                let remote_major = self.remote_ver[0];
                let sync_mode = self.cfg.client_sync_mode;
                let item = self.items.get_mut(&net_id).expect("net item");

                item.reset_dirty_value();
                item.reset_dirty_mode();

                self.sync_queue.push_back(net_id);
                let mode_pending = !item.mode_wire().is_empty() && !item.is_dirty_mode();

                let is_master = item.is_master();
                let is_null = item.data_type() == DataType::Null;
                let mut ini_master = false;
                let mut ini_slave = false;

                match sync_mode {
                    ClientSyncMode::StdAutoMaster => {
                        if remote_major >= 3 {
                            ini_master = item.local_update_since_stop() > 0;
                            ini_slave = is_master && is_null;
                        }
                    }
                    ClientSyncMode::ImplicitMaster => {
                        if !is_master && item.item.local_update_count() > 0 {
                            item.item.add_sync_mode(SyncMode::MASTER, true);
                        }
                        if remote_major >= 3 {
                            ini_slave = item.is_master() && is_null && item.item.is_save_mode();
                        }
                    }
                    ClientSyncMode::ExplicitMaster => {
                        if remote_major >= 3 {
                            ini_slave = is_master && is_null && item.item.is_save_mode();
                        }
                    }
                    _ => {}
                }

                item.set_ini_master(ini_master);
                item.set_ini_slave(ini_slave);

                let blocked = item.is_pipe_mode() || item.is_folder();
                let push_value = item.is_master_at_start() && !blocked;
                if push_value {
                    item.reset_echo_seq();
                    item.set_sync_flux(true);
                }
                (push_value, mode_pending)
            };

            if mode_pending {
                self.mode_queue.push_back(net_id);
            }
            if push_value {
                self.item_value_updater(net_id, &WriteMeta::null(), None);
            }
        }

        self.set_state(SyncState::Normal);
    }

    // ---- net items ------------------------------------------------------

    fn register_item(&mut self, net_id: u32, mut item: NetHandle) {
        item.set_net_id(net_id);
        self.by_handle.insert(item.item.id(), net_id);
        self.items.insert(net_id, item);
    }

    fn remove_item_refs(&mut self, net_id: u32) {
        if let Some(item) = self.items.remove(&net_id) {
            self.by_handle.remove(&item.item.id());
            item.item.close();
        }
        self.sync_queue.retain(|id| *id != net_id);
        self.mode_queue.retain(|id| *id != net_id);
        self.flux_item_queue.retain(|id| *id != net_id);
    }

    /// Client side: share the object at `path` over this session.
    pub async fn new_net_item(
        &mut self,
        path_in: &str,
        sync_mode: SyncMode,
        allow_dup: bool,
    ) -> crate::error::Result<(u32, bool)> {
        let path_full = path::full_path(path_in);

        if !self.remote_allow.intersects(Allow::READ_WRITE) {
            let remote_path = self.to_remote_path(&path_full);
            if !self.is_free_path(&remote_path) {
                let msg = format!("Share object: path={}", path_full);
                self.registry.log_error(&msg, ErrCode::OpNotAllowed);
                return Err(crate::error::Error::new(ErrCode::OpNotAllowed, msg));
            }
        }

        let handle = Handle::new(&self.registry);
        handle.set_queue_delivery(self.intake.clone());
        handle.open_with_flags_async(&path_full, LinkFlags::CREATE_ALLOWED).await?;

        let net_id = handle.link_id();
        if self.items.contains_key(&net_id) {
            if allow_dup {
                let item = self.items.get_mut(&net_id).expect("net item");
                item.item.add_sync_mode(sync_mode, true);
                return Ok((net_id, false));
            }
            return Err(crate::error::Error::new(
                ErrCode::AlreadyOpen,
                format!("already synced: {}", path_full),
            ));
        }

        let mut item = NetHandle::new(handle);
        item.item.add_sync_mode(sync_mode, true);
        item.set_block_echo(true); // a client gives no echo, avoiding loops
        self.register_item(net_id, item);

        if self.is_closed {
            return Ok((net_id, true));
        }
        self.sync_queue.push_back(net_id);
        Ok((net_id, true))
    }

    // ---- record handlers ------------------------------------------------

    async fn do_command_sync(&mut self, map: &RecordMap) -> ErrCode {
        if self.cfg.is_client {
            return ErrCode::RecNotExpected;
        }

        let path = map.value_string("path");
        let smode = map.value_or("smode", b"").to_vec();
        let net_id = map.value_num("id", 0) as u32;

        if !self.allow.intersects(Allow::READ_WRITE) && !self.is_free_path(&path) {
            return ErrCode::OpNotAllowed;
        }

        if self.items.contains_key(&net_id) {
            tracing::debug!(net_id, "item already synced, replacing");
            self.remove_item_refs(net_id);
        }

        let is_create_allow = self.allow.contains(Allow::CREATE);
        let flags = if is_create_allow { LinkFlags::CREATE_ALLOWED } else { LinkFlags::empty() };

        let handle = Handle::new(&self.registry);
        handle.set_queue_delivery(self.intake.clone());
        if handle.open_with_flags_async(&path, flags).await.is_err() {
            return if is_create_allow { ErrCode::CreateError } else { ErrCode::OpNotAllowed };
        }

        let mut item = NetHandle::new(handle);
        // Sync mode from the wire belongs to the session, not the link.
        item.add_sync_mode_wire(&smode, false);
        let is_monitor = item.item.sync_mode().contains(SyncMode::MONITOR);
        self.register_item(net_id, item);

        if is_monitor {
            self.setup_monitor_item(net_id).await;
        }

        let (mode_pending, push_value) = {
            let item = self.items.get_mut(&net_id).expect("net item");
            let mode_pending = !item.mode_wire().is_empty() && item.is_lead_mode_update();

            let blocked = (item.data_type() == DataType::Null && self.remote_ver[0] < 3)
                || item.is_pipe_mode()
                || item.is_folder();
            let push_value = !blocked && !item.is_master_at_start();
            if push_value {
                item.set_sync_flux(true);
                let save = item.item.is_save_mode();
                item.set_save_flux(save);
            }
            (mode_pending, push_value)
        };

        if mode_pending {
            self.add_to_mode_queue(net_id);
        }
        if push_value {
            self.item_value_updater(net_id, &WriteMeta::null(), None);
        }
        ErrCode::Ok
    }

    /// Activates a server-side (or local) monitor: new-item events for all
    /// existing children now, then created-events for future ones.
    async fn setup_monitor_item(&mut self, net_id: u32) {
        if let Some(item) = self.items.get_mut(&net_id) {
            item.set_monitor(true);
        }
        self.do_childs_to_event(net_id).await;
    }

    async fn do_childs_to_event(&mut self, net_id: u32) {
        let Some(item) = self.items.get(&net_id) else { return };
        let path = item.path();
        let tag = self.session_tag;
        let children = self.registry.items_async(&path).await;
        if let Some(item) = self.items.get(&net_id) {
            for child in children {
                item.send_new_item_mon_event(&path::make_path(&path, &child), true, tag);
            }
        }
    }

    fn do_command_mode(&mut self, map: &RecordMap) -> ErrCode {
        if !self.allow.contains(Allow::MODE_CHANGE) {
            return ErrCode::OpNotAllowed;
        }

        let net_id = map.value_num("id", 0) as u32;
        let data = map.value_or("data", b"");

        match self.items.get(&net_id) {
            Some(item) => {
                item.set_mode_wire(data);
                ErrCode::Ok
            }
            None => ErrCode::NotFound,
        }
    }

    fn do_command_no_sync(&mut self, map: &RecordMap) -> ErrCode {
        let net_id = map.value_num("id", 0) as u32;
        if net_id != 0 {
            // A missing item is fine, it may have been destroyed already.
            if self.items.contains_key(&net_id) {
                self.remove_item_refs(net_id);
            }
            return ErrCode::Ok;
        }

        // Tree variant: stop syncing a whole subtree.
        let path = map.value_string("path");
        let no_sync: Vec<u32> = self
            .items
            .iter()
            .filter(|(_, item)| item.path().starts_with(&path))
            .map(|(id, _)| *id)
            .collect();
        for net_id in no_sync {
            self.remove_item_refs(net_id);
        }
        ErrCode::Ok
    }

    fn do_command_flux(&mut self, map: &RecordMap) -> ErrCode {
        if !self.allow.contains(Allow::WRITE) {
            return ErrCode::OpNotAllowed;
        }

        let net_id = map.value_num("id", 0) as u32;
        let rec_type = map.value_or("type", b"");
        let nqrx = map.value_or("nqrx", b"");
        let seq = map.value_or("seq", b"");
        let data = map.value_or("data", b"").to_vec();
        let echo_seq = map.value_num("es", -1) as i8;

        let is_sync_flux = rec_type.contains(&b'I');
        let is_save_flux = rec_type.contains(&b'S');
        let is_only_echo = rec_type.contains(&b'E');
        let is_null = rec_type.contains(&b'N');

        let mut meta = WriteMeta::remote();
        if !nqrx.is_empty() {
            meta.queue_find_regexp = Some(String::from_utf8_lossy(nqrx).into_owned());
        }
        if !seq.is_empty() {
            meta.seq_no = std::str::from_utf8(seq).ok().and_then(|s| s.parse().ok());
        }

        let is_client = self.cfg.is_client;
        let client_sync_mode = self.cfg.client_sync_mode;
        let remote_major = self.remote_ver[0];

        let Some(item) = self.items.get_mut(&net_id) else {
            return ErrCode::NotFound;
        };

        let is_null_blocked = is_null && client_sync_mode == ClientSyncMode::StdAutoMaster;
        let is_echo_pipe_blocked = is_only_echo && item.is_pipe_mode();
        let is_echo_bidir_blocked =
            is_only_echo && !is_sync_flux && item.item.is_bidir_mode() && remote_major >= 3;
        let is_echo_master_blocked = is_only_echo
            && is_client
            && item.is_master()
            && (!is_save_flux || item.data_type() != DataType::Null);
        let is_echo_seq_blocked = is_only_echo && is_client && item.is_echo_seq_old(echo_seq);

        let blocked = is_null_blocked
            || is_echo_pipe_blocked
            || is_echo_bidir_blocked
            || is_echo_master_blocked
            || is_echo_seq_blocked;

        if !blocked {
            if !is_client {
                item.set_echo_seq(echo_seq);
            }
            item.item.import(&data, Some(is_only_echo), meta);
        } else if is_client && is_null_blocked && is_sync_flux && item.data_type() != DataType::Null
        {
            // Server only had null; push our value back as initial sync.
            item.set_sync_flux(true);
            if item.is_lead_value_update() {
                self.add_to_flux_queue(net_id, &WriteMeta::null(), None);
            }
        }
        ErrCode::Ok
    }

    fn do_command_atom_op(&mut self, map: &RecordMap) -> ErrCode {
        if !self.allow.contains(Allow::WRITE) {
            return ErrCode::OpNotAllowed;
        }

        let net_id = map.value_num("id", 0) as u32;
        let op = map.value_or("op", b"");
        let a1 = map.value_or("a1", b"");
        let a2 = map.value_or("a2", b"");

        let Some(item) = self.items.get(&net_id) else {
            return ErrCode::NotFound;
        };
        if !item.item.is_atomic_op_provider() {
            return ErrCode::Ok; // not a provider here, just skip it
        }

        match atomic_op_from_wire(op, a1, a2) {
            Some(crate::event::AtomicOp::BitSet { mask, value }) => item.item.set_bits(mask, value),
            Some(crate::event::AtomicOp::AddInt(v)) => item.item.add_value(v),
            Some(crate::event::AtomicOp::AddReal(v)) => item.item.add_value_real(v),
            None => return ErrCode::Undef,
        }
        ErrCode::Ok
    }

    fn do_command_event(&mut self, map: &RecordMap) -> ErrCode {
        // The allow mask was already enforced when sync accepted the path.
        let net_id = map.value_num("id", 0) as u32;
        let type_str = map.value_or("type", b"");
        let data = map.value_or("data", b"");

        let Some(ev) = MonEvent::from_wire(type_str) else {
            return ErrCode::RecUnknown;
        };
        let Some(item) = self.items.get(&net_id) else {
            if ev == MonEvent::ItemDeleted {
                return ErrCode::Ok; // item already deleted
            }
            return ErrCode::NotFound;
        };

        item.send_mon_event(ev, data, false, self.session_tag);
        ErrCode::Ok
    }

    async fn do_command_set(&mut self, map: &RecordMap) -> ErrCode {
        if self.cfg.is_client {
            return ErrCode::RecNotExpected;
        }
        if !self.allow.contains(Allow::WRITE) {
            return ErrCode::OpNotAllowed;
        }

        let path = map.value_string("path");
        let data = map.value_or("data", b"").to_vec();

        let mut reply = RecordMap::command("Rset");
        reply.add_str("path", &path);
        self.send(&reply);

        let is_create_allow = self.allow.contains(Allow::CREATE);
        let flags = if is_create_allow { LinkFlags::CREATE_ALLOWED } else { LinkFlags::empty() };
        let item = Handle::new(&self.registry);
        if item.open_with_flags_async(&path, flags).await.is_err() {
            return if is_create_allow { ErrCode::CreateError } else { ErrCode::OpNotAllowed };
        }

        if !item.is_folder() {
            item.import(&data, Some(false), WriteMeta::remote());
        }
        ErrCode::Ok
    }

    async fn do_command_get(&mut self, map: &RecordMap) -> ErrCode {
        if self.cfg.is_client {
            return ErrCode::RecNotExpected;
        }

        let path = map.value_string("path");
        if !self.allow.contains(Allow::READ) && !self.is_free_path(&path) {
            return ErrCode::OpNotAllowed;
        }

        let item = Handle::new(&self.registry);
        if item.open_with_flags_async(&path, LinkFlags::CREATE_ALLOWED).await.is_err() {
            return ErrCode::CreateError;
        }

        let mut reply = RecordMap::command("Rget");
        reply.add_str("path", &path);
        if item.data_type() == DataType::Null {
            reply.add_str("type", "N");
        }
        reply.add("data", &item.export());
        self.send(&reply);
        ErrCode::Ok
    }

    async fn do_command_ls(&mut self, map: &RecordMap) -> ErrCode {
        if self.cfg.is_client {
            return ErrCode::RecNotExpected;
        }

        let path = map.value_string("path");
        if !self.allow.contains(Allow::READ) && !self.is_free_path(&path) {
            return ErrCode::OpNotAllowed;
        }

        let folder = Handle::new(&self.registry);
        if folder
            .open_with_flags_async(&path, LinkFlags::FOLDER | LinkFlags::SILENT_ERROR)
            .await
            .is_err()
        {
            return ErrCode::NotFound;
        }

        let mut reply = RecordMap::command("Rls");
        reply.add_str("path", &path);
        for (i, sub_item) in self.registry.items_async(&path).await.iter().enumerate() {
            reply.add_enum("item", i + 1, sub_item);
        }
        self.send(&reply);
        ErrCode::Ok
    }

    fn do_command_delete(&mut self, map: &RecordMap) -> ErrCode {
        if !self.allow.contains(Allow::DELETE) {
            return ErrCode::OpNotAllowed;
        }

        let net_id = map.value_num("id", 0) as u32;
        if net_id != 0 {
            // A missing item is fine, it may have been destroyed already.
            if let Some(item) = self.items.get_mut(&net_id) {
                item.set_disabled(); // prevent echoing the delete back
                item.item.destroy(true);
            }
        } else {
            let path = map.value_string("path");
            if path.is_empty() {
                return ErrCode::NotFound;
            }
            // A tree delete names a remote path; retire the local subtree
            // behind the mount (or directly, on the server).
            let local = if self.cfg.is_client {
                self.to_local_path(&path)
            } else {
                Some(path.clone())
            };
            if let Some(local) = local {
                self.registry.destroy_path(&local, true);
            }
            self.emit(SessionEvent::DeletePath(path));
        }
        ErrCode::Ok
    }

    fn do_command_message(&mut self, map: &RecordMap) -> ErrCode {
        let mtype = map.value_num("type", 0);
        let data = map.value_or("data", b"").to_vec();
        self.emit(SessionEvent::Message { mtype, data });
        ErrCode::Ok
    }

    // ---- local event intake ---------------------------------------------

    /// Drains queued link events from this session's handles and mounts.
    pub async fn drain_intake(&mut self) {
        while let Some((core, ev)) = self.intake.pop() {
            self.handle_local_event(&core, ev).await;
        }
    }

    async fn handle_local_event(&mut self, core: &Arc<HandleCore>, ev: LinkEvent) {
        let handle_id = core.id();
        if let Some(&net_id) = self.by_handle.get(&handle_id) {
            self.handle_item_event(net_id, &ev).await;
        } else if let Some(idx) = self.mounts.iter().position(|m| m.handle.id() == handle_id) {
            self.handle_mount_event(idx, &ev).await;
        }
        core.apply_default_policy(&ev);
    }

    /// The session's view of one of its net items changing locally.
    async fn handle_item_event(&mut self, net_id: u32, ev: &LinkEvent) {
        match ev {
            LinkEvent::ValueChanged { send_id, value_data, meta } => {
                let lead = {
                    let is_client = self.cfg.is_client;
                    let Some(item) = self.items.get_mut(&net_id) else { return };
                    if item.is_block(*send_id) {
                        return; // update originated here, blocked as echo
                    }
                    item.add_is_only_echo(*send_id);
                    if is_client {
                        item.next_echo_seq();
                        item.set_sync_flux(false);
                    } else if !item.is_only_echo() {
                        item.reset_echo_seq();
                        item.set_sync_flux(false);
                        item.set_save_flux(meta.from_persist);
                    }
                    item.is_lead_value_update()
                };
                if lead {
                    self.add_to_flux_queue(net_id, meta, value_data.as_deref());
                }
            }
            LinkEvent::AtomicOp { op } => {
                self.atomic_op_to_flux_queue(net_id, op);
            }
            LinkEvent::ModeChanged { path: ev_path, mode, .. } => {
                let (is_folder, is_monitor) = match self.items.get(&net_id) {
                    Some(item) => (item.is_folder(), item.is_monitor()),
                    None => return,
                };
                if is_monitor {
                    // Tell the monitor's peer about mode changes below.
                    let mut xsm = RecordMap::new();
                    xsm.add_str("path", ev_path);
                    xsm.add("mode", &mode.to_wire().into_bytes());
                    let data = xsm.to_line(RecOptions::default());
                    if let Some(item) = self.items.get(&net_id) {
                        item.send_mon_event(MonEvent::ItemModeChg, &data, true, self.session_tag);
                    }
                }
                if !is_folder {
                    let lead = self
                        .items
                        .get_mut(&net_id)
                        .map(|item| item.is_lead_mode_update())
                        .unwrap_or(false);
                    if lead {
                        self.add_to_mode_queue(net_id);
                    }
                }
            }
            LinkEvent::LinkCreated { path: ev_path, is_last, .. } => {
                let Some(item) = self.items.get(&net_id) else { return };
                if item.is_monitor() && *is_last {
                    item.send_new_item_mon_event(ev_path, false, self.session_tag);
                }
            }
            LinkEvent::Monitor { ev, data, is_local, session_tag } => {
                if *session_tag == self.session_tag {
                    self.do_mon_event(net_id, *ev, data.clone(), *is_local).await;
                }
            }
            LinkEvent::Retired { start, is_below, .. } => {
                let is_monitor = self.items.get(&net_id).map(|i| i.is_monitor()).unwrap_or(false);
                if is_monitor {
                    let destroy_path = if *is_below {
                        start.path()
                    } else {
                        self.items.get(&net_id).map(|i| i.path()).unwrap_or_default()
                    };
                    self.do_mon_event(net_id, MonEvent::ItemDeleted, destroy_path.into_bytes(), true)
                        .await;
                }

                if !is_below {
                    self.destroy_to_flux_queue(net_id);
                    self.remove_item_refs(net_id);
                }
            }
        }
    }

    /// Monitor event logic, shared between local bootstrap and remote
    /// `event` records.
    async fn do_mon_event(&mut self, net_id: u32, ev: MonEvent, data: Vec<u8>, is_local: bool) {
        if is_local {
            let allowed = {
                let Some(item) = self.items.get(&net_id) else { return };
                self.remote_allow.contains(Allow::READ)
                    || self.is_free_path(&self.to_remote_path(&item.path()))
            };
            if allowed {
                self.event_to_flux_queue(net_id, ev, &data);
            }
        }

        match ev {
            MonEvent::MonitorStart => {
                if is_local && self.cfg.is_client {
                    // Re-demand the monitor if this item is ever re-synced.
                    if let Some(item) = self.items.get_mut(&net_id) {
                        item.item.add_sync_mode(SyncMode::MONITOR, true);
                    }
                } else if !is_local && !self.cfg.is_client {
                    let already = self
                        .items
                        .get(&net_id)
                        .map(|i| i.item.sync_mode().contains(SyncMode::MONITOR))
                        .unwrap_or(true);
                    if !already {
                        self.setup_monitor_item(net_id).await;
                        if let Some(item) = self.items.get_mut(&net_id) {
                            item.item.add_sync_mode(SyncMode::MONITOR, false);
                        }
                    }
                }
            }
            MonEvent::MonitorReStart => {
                if !is_local && !self.cfg.is_client {
                    self.do_childs_to_event(net_id).await;
                }
            }
            _ => {}
        }
    }

    /// Mount-point folder activity (client side): share new leaves, push
    /// tree creation and destruction to the server.
    async fn handle_mount_event(&mut self, idx: usize, ev: &LinkEvent) {
        match ev {
            LinkEvent::LinkCreated { path: ev_path, link, is_last } => {
                if !is_last {
                    return;
                }
                if link.is_folder() {
                    let remote = self.to_remote_path(ev_path);
                    self.send_set_tree(&remote);
                } else {
                    let _ = self.new_net_item(ev_path, SyncMode::empty(), true).await;
                }
            }
            LinkEvent::Retired { start, is_below: _, is_global } => {
                if start.is_folder() {
                    let remote = self.to_remote_path(&start.path());
                    if *is_global {
                        self.send_delete(&remote);
                    } else {
                        self.send_no_sync(&remote);
                    }
                }
            }
            _ => {
                let _ = idx;
            }
        }
    }

    // ---- queues ---------------------------------------------------------

    fn next_queue_num(&mut self) -> i64 {
        self.queue_num_count += 1;
        self.queue_num_count
    }

    fn item_value_updater(&mut self, net_id: u32, meta: &WriteMeta, value_data: Option<&[u8]>) {
        let lead = match self.items.get_mut(&net_id) {
            Some(item) => item.is_lead_value_update(),
            None => return,
        };
        if lead {
            self.add_to_flux_queue(net_id, meta, value_data);
        }
    }

    fn add_to_mode_queue(&mut self, net_id: u32) {
        let allowed = self.remote_allow.contains(Allow::MODE_CHANGE)
            || (!self.cfg.is_client
                && self
                    .items
                    .get(&net_id)
                    .map(|i| self.is_free_path(&i.path()))
                    .unwrap_or(false));
        if !allowed {
            if let Some(item) = self.items.get_mut(&net_id) {
                item.reset_dirty_mode(); // arm for a new mode update
            }
            return;
        }
        if self.is_closed {
            return;
        }
        self.mode_queue.push_back(net_id);
    }

    fn add_to_flux_queue(&mut self, net_id: u32, meta: &WriteMeta, value_data: Option<&[u8]>) {
        let is_pipe = match self.items.get(&net_id) {
            Some(item) => item.is_pipe_mode(),
            None => return,
        };

        if is_pipe {
            if !self.is_connect_started {
                return;
            }
            let drop_it = {
                let item = self.items.get(&net_id).expect("net item");
                item.is_only_echo()
                    || item.data_type() == DataType::Null
                    || (!self.remote_allow.contains(Allow::WRITE)
                        && (self.cfg.is_client || !self.is_free_path(&item.path())))
            };
            if drop_it {
                // Never send an echo or null into a pipe; arm for more.
                self.items.get_mut(&net_id).expect("net item").reset_dirty_value();
                return;
            }

            let flux_map = self.make_flux_map(net_id, meta, value_data);
            self.items.get_mut(&net_id).expect("net item").reset_dirty_value();
            let queue_num = self.next_queue_num();
            let rec = FluxRec { map: flux_map, queue_num };

            if let Some(pattern) = &meta.queue_find_regexp {
                let found = self.flux_pipe_queue.iter_mut().find(|q| {
                    pattern_match(pattern, &flux_payload_text(&q.map))
                });
                match found {
                    Some(slot) => {
                        // Overwrite the matching pending record in place.
                        slot.map = rec.map;
                    }
                    None => self.flux_pipe_queue.push_back(rec),
                }
            } else {
                self.flux_pipe_queue.push_back(rec);
            }
        } else {
            if self.is_closed {
                return;
            }
            let drop_it = {
                let item = self.items.get(&net_id).expect("net item");
                let echo_bidir =
                    item.is_only_echo() && item.item.is_bidir_mode() && !item.is_sync_flux();
                let echo_master = !self.cfg.is_client
                    && item.is_master()
                    && item.is_only_echo()
                    && !item.is_sync_flux();
                let rem_allow = !self.remote_allow.contains(Allow::WRITE)
                    && (self.cfg.is_client || !self.is_free_path(&item.path()));
                echo_bidir || echo_master || rem_allow
            };
            if drop_it {
                self.items.get_mut(&net_id).expect("net item").reset_dirty_value();
                return;
            }
            let queue_num = self.next_queue_num();
            self.items.get_mut(&net_id).expect("net item").set_queue_num(queue_num);
            self.flux_item_queue.push_back(net_id);
        }
    }

    fn event_to_flux_queue(&mut self, net_id: u32, ev: MonEvent, data: &[u8]) {
        if net_id == 0 || !self.is_connect_started {
            return;
        }
        let mut map = RecordMap::command("event");
        map.add_num("id", net_id as i64);
        map.add_str("type", ev.as_wire());
        map.add("data", data);
        let queue_num = self.next_queue_num();
        self.flux_pipe_queue.push_back(FluxRec { map, queue_num });
    }

    fn atomic_op_to_flux_queue(&mut self, net_id: u32, op: &crate::event::AtomicOp) {
        if !self.is_connect_started {
            return;
        }
        let (op_str, a1, a2) = atomic_op_to_wire(op);
        let mut map = RecordMap::command("atomop");
        map.add_num("id", net_id as i64);
        map.add_str("op", op_str);
        map.add_str("a1", &a1);
        if let Some(a2) = a2 {
            map.add_str("a2", &a2);
        }
        let queue_num = self.next_queue_num();
        self.flux_pipe_queue.push_back(FluxRec { map, queue_num });
    }

    fn destroy_to_flux_queue(&mut self, net_id: u32) {
        let Some(item) = self.items.get(&net_id) else { return };
        if item.is_disabled() || !self.is_connect_started {
            return;
        }
        if !self.remote_allow.contains(Allow::DELETE) {
            return;
        }
        let rt = item.retire_kind();
        if matches!(rt, RetireKind::Tree | RetireKind::None) {
            return; // tree deletes travel by path, from the mount ear
        }

        // A server always propagates a leaf destroy globally.
        let is_global = rt == RetireKind::LeafGlobal || !self.cfg.is_client;
        let cmd = if is_global {
            if self.remote_ver[0] >= 2 {
                "delete"
            } else {
                "destroy"
            }
        } else {
            "nosync"
        };
        let mut map = RecordMap::command(cmd);
        map.add_num("id", net_id as i64);
        let queue_num = self.next_queue_num();
        self.flux_pipe_queue.push_back(FluxRec { map, queue_num });
    }

    // ---- sending --------------------------------------------------------

    /// Drains the queues into the outbound buffer, honoring fairness.
    /// Call whenever something was enqueued and the state allows sending.
    pub fn pump_queues(&mut self) {
        loop {
            if !self.is_connected {
                return;
            }
            if self.state != SyncState::Normal {
                if self.is_closed && !self.wants_disconnect {
                    self.close_final();
                }
                return;
            }

            if let Some(net_id) = self.sync_queue.pop_front() {
                self.send_sync_item(net_id);
                continue;
            }
            if let Some(net_id) = self.mode_queue.pop_front() {
                self.send_mode_item(net_id);
                if let Some(item) = self.items.get_mut(&net_id) {
                    item.reset_dirty_mode();
                }
                continue;
            }

            let item_num = self
                .flux_item_queue
                .front()
                .and_then(|id| self.items.get(id))
                .map(|item| item.queue_num());
            let pipe_num = self.flux_pipe_queue.front().map(|rec| rec.queue_num);

            match (item_num, pipe_num) {
                (None, None) => {
                    if self.flux_item_queue.pop_front().is_some() {
                        continue; // stale entry for a removed item
                    }
                    if self.is_closed && !self.wants_disconnect {
                        self.close_final();
                    }
                    return;
                }
                (Some(inum), pnum) => {
                    let item_rel = inum - self.queue_num_done;
                    let pipe_rel = pnum.map(|p| p - self.queue_num_done).unwrap_or(i64::MAX);
                    if item_rel <= pipe_rel {
                        self.queue_num_done = inum;
                        let net_id = self.flux_item_queue.pop_front().expect("queue head");
                        self.send_flux_item(net_id);
                        if let Some(item) = self.items.get_mut(&net_id) {
                            item.reset_dirty_value();
                        }
                    } else {
                        self.queue_num_done = pnum.expect("pipe head");
                        let rec = self.flux_pipe_queue.pop_front().expect("queue head");
                        self.send(&rec.map);
                    }
                }
                (None, Some(pnum)) => {
                    if self.flux_item_queue.pop_front().is_some() {
                        continue; // head referenced a removed item
                    }
                    self.queue_num_done = pnum;
                    let rec = self.flux_pipe_queue.pop_front().expect("queue head");
                    self.send(&rec.map);
                }
            }
        }
    }

    fn make_flux_map(&self, net_id: u32, meta: &WriteMeta, value_data: Option<&[u8]>) -> RecordMap {
        let item = self.items.get(&net_id).expect("net item");

        let mut rec_type = Vec::new();
        if item.is_sync_flux() {
            rec_type.push(b'I');
        }
        if item.is_only_echo() {
            rec_type.push(b'E');
        }
        if item.is_save_flux() {
            rec_type.push(b'S');
        }
        if item.data_type() == DataType::Null {
            rec_type.push(b'N');
        }

        let mut map = RecordMap::command("flux");
        map.add_num("id", net_id as i64);
        if !rec_type.is_empty() {
            map.add("type", &rec_type);
        }
        let echo_seq = item.echo_seq();
        if echo_seq >= 0 {
            map.add_num("es", echo_seq as i64);
        }
        if let Some(pattern) = &meta.queue_find_regexp {
            map.add_str("nqrx", pattern);
        } else if let Some(seq_no) = meta.seq_no {
            map.add_num("seq", seq_no);
        }
        match value_data {
            Some(data) => map.add("data", data),
            None => map.add("data", &item.item.export()),
        };
        map
    }

    fn send_sync_item(&mut self, net_id: u32) {
        let Some(item) = self.items.get(&net_id) else { return };
        if !item.is_open() {
            return;
        }
        let mut map = RecordMap::command("sync");
        map.add_str("path", &self.to_remote_path(&item.path()));
        map.add_num("id", net_id as i64);
        let smode = item.sync_mode_wire();
        if !smode.is_empty() {
            map.add("smode", &smode);
        }
        self.send(&map);
    }

    fn send_mode_item(&mut self, net_id: u32) {
        let Some(item) = self.items.get(&net_id) else { return };
        if !item.is_open() {
            return;
        }
        let mut map = RecordMap::command("mode");
        map.add_num("id", net_id as i64);
        map.add("data", &item.mode_wire());
        self.send(&map);
    }

    fn send_flux_item(&mut self, net_id: u32) {
        let Some(item) = self.items.get(&net_id) else { return };
        if !item.is_open() {
            return;
        }
        let map = self.make_flux_map(net_id, &WriteMeta::null(), None);
        self.send(&map);
    }

    fn send_no_sync(&mut self, path: &str) {
        let mut map = RecordMap::command("nosync");
        map.add_str("path", path);
        self.send(&map);
    }

    fn send_set_tree(&mut self, path: &str) {
        if !self.remote_allow.contains(Allow::WRITE) {
            return;
        }
        let mut map = RecordMap::command("set");
        map.add_str("path", path);
        self.send(&map);
    }

    fn send_delete(&mut self, path: &str) {
        if !self.remote_allow.contains(Allow::DELETE) {
            return;
        }
        let mut map = RecordMap::command("delete");
        map.add_str("path", path);
        self.send(&map);
    }

    // ---- free paths and mounts ------------------------------------------

    fn is_free_path(&self, path: &str) -> bool {
        self.free_paths.iter().any(|fp| path.starts_with(fp.as_str()))
    }

    fn to_remote_path(&self, local_path: &str) -> String {
        for mount in &self.mounts {
            if local_path.starts_with(&mount.local_path) {
                return path::change_base_path(&mount.local_path, &mount.remote_path, local_path);
            }
        }
        local_path.to_string()
    }

    fn to_local_path(&self, remote_path: &str) -> Option<String> {
        for mount in &self.mounts {
            if remote_path.starts_with(&mount.remote_path) {
                return Some(path::change_base_path(
                    &mount.remote_path,
                    &mount.local_path,
                    remote_path,
                ));
            }
        }
        None
    }

    pub async fn add_mount(&mut self, local_path: &str, remote_path: &str) -> bool {
        if local_path.is_empty() {
            return false;
        }
        let local = path::full_path(local_path);
        let remote =
            if remote_path.is_empty() { local.clone() } else { path::full_path(remote_path) };

        // Mount points must not nest.
        for mount in &self.mounts {
            if local.starts_with(&mount.local_path) || mount.local_path.starts_with(&local) {
                self.registry.log_error(
                    &format!("Mount points not exclusive: new={} existing={}", local, mount.local_path),
                    ErrCode::Undef,
                );
                return false;
            }
        }

        let handle = Handle::new(&self.registry);
        handle.set_queue_delivery(self.intake.clone());
        if handle
            .open_with_flags_async(&local, LinkFlags::CREATE_ALLOWED | LinkFlags::FOLDER)
            .await
            .is_err()
        {
            return false;
        }
        self.mounts.push(MountPoint { handle, local_path: local, remote_path: remote });
        true
    }

    pub fn remove_mount(&mut self, local_path: &str) -> bool {
        let local = path::full_path(local_path);
        match self.mounts.iter().position(|m| m.local_path == local) {
            Some(idx) => {
                self.mounts.remove(idx);
                true
            }
            None => false,
        }
    }

    // ---- timers ---------------------------------------------------------

    /// One-second housekeeping: login retry delay, receive timeout with
    /// `ver` keepalive at T and abort at 3T, heartbeat exchange.
    pub fn on_tick(&mut self) {
        if let Some(at) = self.login_delay_until {
            if Instant::now() >= at {
                self.do_login_seq0_end();
            }
        }

        if !self.is_connected {
            return;
        }

        let timeout = Duration::from_secs(self.cfg.receive_timeout.max(1) as u64);
        let idle_rx = self.last_rx.elapsed();

        if self.cfg.is_client && idle_rx >= timeout && !self.keepalive_sent {
            let mut map = RecordMap::command("ver");
            map.add_str("type", SYNC_TYPE).add_str("ver", SYNC_VERSION);
            self.send(&map);
            self.keepalive_sent = true;
        }
        if idle_rx >= 3 * timeout {
            tracing::warn!("receive timeout, aborting session");
            self.wants_disconnect = true;
            return;
        }

        if self.state == SyncState::Normal {
            if self.last_tx.elapsed() >= timeout {
                self.send(&RecordMap::command("$heartbeat"));
            }
            let hb_ok = idle_rx < 2 * timeout;
            if hb_ok != self.heart_beat_ok {
                self.heart_beat_ok = hb_ok;
                self.emit(SessionEvent::HeartBeatChanged(hb_ok));
            }
        }
    }

    // ---- commands from the owner ----------------------------------------

    pub async fn handle_cmd(&mut self, cmd: SessionCmd) {
        match cmd {
            SessionCmd::Login { user, pw_hash, allow } => {
                self.login_to(&user, &pw_hash, allow);
            }
            SessionCmd::SendMessage { mtype, data } => {
                self.send_message(mtype, &data);
            }
            SessionCmd::SendRecord(map) => {
                self.send(&map);
            }
            SessionCmd::NewNetItem { path, sync_mode, reply } => {
                let ret = self.new_net_item(&path, sync_mode, true).await;
                let _ = reply.try_send(ret);
            }
            SessionCmd::MonitorStart { net_id, restart } => {
                let ev = if restart { MonEvent::MonitorReStart } else { MonEvent::MonitorStart };
                if let Some(item) = self.items.get(&net_id) {
                    item.send_mon_event(ev, &[], true, self.session_tag);
                }
            }
            SessionCmd::AddMount { local_path, remote_path, reply } => {
                let ok = self.add_mount(&local_path, &remote_path).await;
                let _ = reply.try_send(ok);
            }
            SessionCmd::RemoveMount { local_path, reply } => {
                let ok = self.remove_mount(&local_path);
                let _ = reply.try_send(ok);
            }
            SessionCmd::Close => {
                self.close();
                // Pipe entries are discarded; the other queues drain out
                // before the final exit.
                self.flux_pipe_queue.clear();
                if self.is_connected {
                    self.pump_queues();
                } else {
                    self.wants_disconnect = true;
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn flux_pipe_payloads(&self) -> Vec<String> {
        self.flux_pipe_queue.iter().map(|q| flux_payload_text(&q.map)).collect()
    }

    // ---- connection driving ---------------------------------------------

    /// Runs one connection to completion. Inbound bytes, queued link
    /// events, owner commands and the tick timer are multiplexed here;
    /// outbound records are flushed between steps.
    pub async fn drive(
        &mut self,
        mut stream: NetStream,
        cmds: &mut mpsc::UnboundedReceiver<SessionCmd>,
    ) -> DriveEnd {
        enum Step {
            Read(std::io::Result<usize>),
            Intake,
            Cmd(Option<SessionCmd>),
            Tick,
        }

        let intake = self.intake.clone();
        let mut read_buf = vec![0u8; 16 * 1024];
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            while let Some(buf) = self.take_out() {
                if let Err(err) = stream.write_all(&buf).await {
                    return DriveEnd::Io(err);
                }
            }

            if self.wants_disconnect {
                self.wants_disconnect = false;
                let _ = stream.shutdown().await;
                return DriveEnd::Aborted;
            }

            if let Some(is_server) = self.take_pending_tls() {
                if let Err(err) = stream.upgrade(is_server, self.cfg.tls.as_ref()).await {
                    return DriveEnd::Io(err);
                }
                self.set_encrypted();
                self.on_encrypted();
                continue;
            }

            let step = tokio::select! {
                read = stream.read(&mut read_buf) => Step::Read(read),
                _ = intake.notified() => Step::Intake,
                cmd = cmds.recv() => Step::Cmd(cmd),
                _ = tick.tick() => Step::Tick,
            };

            match step {
                Step::Read(Ok(0)) => return DriveEnd::PeerClosed,
                Step::Read(Ok(n)) => {
                    let data = read_buf[..n].to_vec();
                    self.feed(&data).await;
                }
                Step::Read(Err(err)) => return DriveEnd::Io(err),
                Step::Intake => {}
                Step::Cmd(Some(cmd)) => self.handle_cmd(cmd).await,
                Step::Cmd(None) => return DriveEnd::Aborted,
                Step::Tick => self.on_tick(),
            }

            self.drain_intake().await;
            self.pump_queues();
        }
    }
}
