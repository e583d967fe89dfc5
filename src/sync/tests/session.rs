//! Protocol state machine tests, driving a session core directly with
//! hand-built peer records.

use crate::handle::Handle;
use crate::mode::SyncMode;
use crate::registry::Registry;
use crate::sync::login::LoginTable;
use crate::sync::session::{SessionConfig, SessionCore};
use crate::sync::{Allow, InfoType, SyncState};
use crate::wire::{LineDecoder, RecOptions, RecordMap};

fn take_records(core: &mut SessionCore) -> Vec<RecordMap> {
    let mut decoder = LineDecoder::new();
    while let Some(buf) = core.take_out() {
        decoder.feed(&buf);
    }
    let opts = RecOptions::for_version(4);
    let mut out = Vec::new();
    while let Some(payload) = decoder.next_record().unwrap() {
        out.push(RecordMap::from_line(&payload, opts).unwrap());
    }
    out
}

async fn feed_line(core: &mut SessionCore, line: &str) {
    core.feed(format!("{}\r\n", line).as_bytes()).await;
}

/// Walks a client core through version, info and no-login negotiation.
async fn negotiate_client_to_normal(core: &mut SessionCore) {
    core.connect_started();
    core.connected();

    let recs = take_records(core);
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].command_word(), b"ver");
    assert_eq!(core.state(), SyncState::Version);

    feed_line(core, "Rver type=SyncTree ver=5.0").await;
    assert_eq!(core.state(), SyncState::Info);
    let recs = take_records(core);
    assert_eq!(recs.last().unwrap().value_num("type", 0), InfoType::EncryptAsk as i64);

    feed_line(core, &format!("Rinfo type={} data=encryptPol\\=1", InfoType::EncryptAsk as i64))
        .await;
    let recs = take_records(core);
    assert_eq!(recs.last().unwrap().value_num("type", 0), InfoType::FreePaths as i64);

    feed_line(core, &format!("Rinfo type={} data=/Local/Sys/Legal/", InfoType::FreePaths as i64))
        .await;
    let recs = take_records(core);
    assert_eq!(recs.last().unwrap().value_num("type", 0), InfoType::WhoIAm as i64);

    feed_line(core, &format!("Rinfo type={} data=", InfoType::WhoIAm as i64)).await;
    assert_eq!(core.state(), SyncState::Login);
    let recs = take_records(core);
    let login = recs.last().unwrap();
    assert_eq!(login.command_word(), b"login");
    assert_eq!(login.value_num("seq", -1), 0);

    feed_line(core, "login seq=1 demand=0 salt2=77").await;
    assert_eq!(core.state(), SyncState::Normal);
}

#[tokio::test]
async fn test_client_negotiation_to_normal() {
    let reg = Registry::new();
    let mut core = SessionCore::new(reg, SessionConfig::client());
    negotiate_client_to_normal(&mut core).await;
}

#[tokio::test]
async fn test_pipe_coalescing_by_pattern() {
    let reg = Registry::new();
    let mut core = SessionCore::new(reg.clone(), SessionConfig::client());
    negotiate_client_to_normal(&mut core).await;
    take_records(&mut core);

    // The user end of the pipe; writes cross onto the provider half that
    // the session shares.
    let pipe = Handle::open(&reg, "/P/chan").unwrap();
    pipe.set_pipe_mode();
    let (net_id, is_new) = core.new_net_item("/P/chan!", SyncMode::empty(), true).await.unwrap();
    assert!(is_new && net_id != 0);

    pipe.set_string_overwrite("A1", "^A\\d");
    pipe.set_string_overwrite("A2", "^A\\d");
    pipe.set_string_overwrite("B1", "^A\\d");
    core.drain_intake().await;

    // Before anything leaves the socket, A1 has been overwritten by A2.
    assert_eq!(core.flux_pipe_payloads(), vec!["A2".to_string(), "B1".to_string()]);

    core.pump_queues();
    let recs = take_records(&mut core);
    assert_eq!(recs[0].command_word(), b"sync");
    let flux: Vec<&RecordMap> = recs.iter().filter(|r| r.command_word() == b"flux").collect();
    assert_eq!(flux.len(), 2);
    assert!(flux[0].value_or("data", b"").ends_with(b"A2"));
    assert!(flux[1].value_or("data", b"").ends_with(b"B1"));
}

#[tokio::test]
async fn test_plain_pipe_writes_do_not_coalesce() {
    let reg = Registry::new();
    let mut core = SessionCore::new(reg.clone(), SessionConfig::client());
    negotiate_client_to_normal(&mut core).await;
    take_records(&mut core);

    let pipe = Handle::open(&reg, "/P/plain").unwrap();
    pipe.set_pipe_mode();
    core.new_net_item("/P/plain!", SyncMode::empty(), true).await.unwrap();

    pipe.set_string("one");
    pipe.set_string("one");
    pipe.set_string("two");
    core.drain_intake().await;

    assert_eq!(
        core.flux_pipe_payloads(),
        vec!["one".to_string(), "one".to_string(), "two".to_string()]
    );
}

#[tokio::test]
async fn test_normal_leaf_sends_latest_value_once() {
    let reg = Registry::new();
    let mut core = SessionCore::new(reg.clone(), SessionConfig::client());
    negotiate_client_to_normal(&mut core).await;
    take_records(&mut core);

    let leaf = Handle::open(&reg, "/X/y").unwrap();
    core.new_net_item("/X/y", SyncMode::empty(), true).await.unwrap();

    // Three writes while nothing is transmitted coalesce into one flux
    // record carrying the last value.
    leaf.set_int(5);
    leaf.set_int(6);
    leaf.set_int(7);
    core.drain_intake().await;
    core.pump_queues();

    let recs = take_records(&mut core);
    let flux: Vec<&RecordMap> = recs.iter().filter(|r| r.command_word() == b"flux").collect();
    assert_eq!(flux.len(), 1);
    assert_eq!(flux[0].value_or("data", b""), b"7");
}

#[tokio::test]
async fn test_server_rejects_wrong_password() {
    let reg = Registry::new();
    let mut table = LoginTable::new();
    table.add_access("alice", "right", Allow::all());

    let mut cfg = SessionConfig::server();
    cfg.demand_login = true;
    cfg.login_table = Some(std::sync::Arc::new(table));
    let mut core = SessionCore::new(reg, cfg);
    core.start_server();
    assert_eq!(core.state(), SyncState::Init);

    feed_line(&mut core, "ver type=SyncTree ver=5.0").await;
    assert_eq!(core.state(), SyncState::Login);
    take_records(&mut core);

    feed_line(&mut core, "login seq=0 demand=1 salt1=11").await;
    let recs = take_records(&mut core);
    let seq1 = recs.last().unwrap();
    assert_eq!(seq1.value_num("seq", -1), 1);

    feed_line(&mut core, "login seq=2 user=alice pass=0000").await;
    let recs = take_records(&mut core);
    let seq3 = recs.last().unwrap();
    assert_eq!(seq3.value_num("seq", -1), 3);
    assert_eq!(seq3.value_num("stat", -1), 0);
    assert_eq!(seq3.value_num("allow", -1), 0);
    assert_ne!(core.state(), SyncState::Normal);
}

#[tokio::test]
async fn test_server_accepts_right_password() {
    use crate::sync::login::{password_hash, pw_hash_xchg};

    let reg = Registry::new();
    let mut table = LoginTable::new();
    table.add_access("alice", "right", Allow::READ_WRITE);

    let mut cfg = SessionConfig::server();
    cfg.demand_login = true;
    cfg.login_table = Some(std::sync::Arc::new(table));
    let mut core = SessionCore::new(reg, cfg);
    core.start_server();

    feed_line(&mut core, "ver type=SyncTree ver=5.0").await;
    take_records(&mut core);
    feed_line(&mut core, "login seq=0 demand=1 salt1=11").await;
    let recs = take_records(&mut core);
    let salt2 = recs.last().unwrap().value_num("salt2", -1);

    let pass = pw_hash_xchg(11, salt2 as u32, &password_hash("right"));
    feed_line(&mut core, &format!("login seq=2 user=alice pass={}", pass)).await;
    let recs = take_records(&mut core);
    let seq3 = recs.last().unwrap();
    assert_eq!(seq3.value_num("stat", -1), 1);
    assert_eq!(seq3.value_num("allow", -1), Allow::READ_WRITE.to_bits_i64());

    feed_line(&mut core, &format!("login seq=4 stat=1 allow={}", Allow::all().to_bits_i64()))
        .await;
    assert_eq!(core.state(), SyncState::Normal);
}

#[tokio::test]
async fn test_unknown_record_gets_err_reply() {
    let reg = Registry::new();
    let mut core = SessionCore::new(reg, SessionConfig::server());
    core.start_server();

    feed_line(&mut core, "gibberish x=1").await;
    let recs = take_records(&mut core);
    let err = recs.last().unwrap();
    assert_eq!(err.command_word(), b"err");

    // The session survives and still answers version queries.
    feed_line(&mut core, "ver").await;
    let recs = take_records(&mut core);
    assert_eq!(recs.last().unwrap().command_word(), b"Rver");
}
