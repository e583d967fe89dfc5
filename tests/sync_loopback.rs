//! End-to-end tests running a server and a client over a loopback socket,
//! each with its own isolated registry.

use std::sync::Arc;
use std::time::Duration;

use synctree::{
    Allow, Client, ClientEvent, ConnectStat, Handle, LoginReason, LoginTable, Monitor, Registry,
    Server, ServerConfig, SyncMode,
};

async fn wait_until<F: FnMut() -> bool>(mut cond: F, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn start_server(registry: &Registry) -> Server {
    let cfg = ServerConfig { bind_addr: "127.0.0.1".to_string(), port: 0, ..Default::default() };
    Server::bind(registry, cfg).await.expect("bind server")
}

async fn connected_client(server: &Server, registry: &Registry) -> Client {
    let client = Client::new(registry);
    client.set_auto_connect(true, 1);
    assert!(client.add_mount_point("/Test/", "").await);
    let addr = server.local_addr();
    client.connect_to_host(&addr.ip().to_string(), addr.port());
    client
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_value_sync_client_to_server() {
    let server_reg = Registry::new();
    let client_reg = Registry::new();
    let server = start_server(&server_reg).await;
    let client = connected_client(&server, &client_reg).await;

    let item = Handle::open(&client_reg, "/Test/x").unwrap();
    item.set_int(7);

    wait_until(|| server_reg.get_int("/Test/x") == Some(7), "server sees 7").await;

    // Follow-up updates flow too.
    item.set_int(8);
    wait_until(|| server_reg.get_int("/Test/x") == Some(8), "server sees 8").await;

    drop(client);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_value_sync_server_to_client() {
    let server_reg = Registry::new();
    let client_reg = Registry::new();
    let server = start_server(&server_reg).await;

    // The server already has data before the client appears.
    server_reg.set_string("/Test/greet", "hello");

    let client = connected_client(&server, &client_reg).await;
    let item = Handle::open(&client_reg, "/Test/greet").unwrap();

    wait_until(|| item.to_string_val().as_deref() == Some("hello"), "client sees greeting").await;

    // A server-side write reaches the client as well.
    server_reg.set_string("/Test/greet", "again");
    wait_until(|| item.to_string_val().as_deref() == Some("again"), "client sees update").await;

    drop(client);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_monitor_found_then_created() {
    let server_reg = Registry::new();
    let client_reg = Registry::new();
    let server = start_server(&server_reg).await;

    server_reg.set_int("/Test/M/a", 1);
    server_reg.set_int("/Test/M/b", 2);

    let client = connected_client(&server, &client_reg).await;
    wait_until(|| client.connect_status() == Some(ConnectStat::Connected), "connected").await;

    let found = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
    let created = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));

    let mut monitor = Monitor::new(&client_reg);
    {
        let found = found.clone();
        monitor.set_on_item_found(Box::new(move |path| found.lock().push(path.to_string())));
    }
    {
        let created = created.clone();
        monitor.set_on_item_created(Box::new(move |path| created.lock().push(path.to_string())));
    }
    monitor.start("/Test/M/", &client).await.unwrap();

    wait_until(|| found.lock().len() >= 2, "existing items found").await;
    {
        let found = found.lock();
        assert!(found.contains(&"/Test/M/a".to_string()), "found: {found:?}");
        assert!(found.contains(&"/Test/M/b".to_string()), "found: {found:?}");
    }
    assert!(created.lock().is_empty());

    server_reg.set_int("/Test/M/c", 3);
    wait_until(|| created.lock().iter().any(|p| p == "/Test/M/c"), "new item created").await;

    drop(client);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_login_reject_then_accept() {
    let server_reg = Registry::new();
    let client_reg = Registry::new();

    let mut login_table = LoginTable::new();
    login_table.add_access("alice", "sesame", Allow::all());
    let cfg = ServerConfig {
        bind_addr: "127.0.0.1".to_string(),
        port: 0,
        login_table,
        ..Default::default()
    };
    let server = Server::bind(&server_reg, cfg).await.unwrap();

    let client = Client::new(&client_reg);
    client.set_auto_connect(true, 1);
    let events = client.events();
    let addr = server.local_addr();
    client.connect_to_host(&addr.ip().to_string(), addr.port());

    // First the server asks for credentials.
    let mut deny_seen = false;
    loop {
        let ev = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("event in time")
            .expect("event stream open");
        match ev {
            ClientEvent::LoginRequired(LoginReason::FirstTry) => {
                if deny_seen {
                    client.login("alice", "sesame", Allow::all());
                } else {
                    client.login("alice", "wrong", Allow::all());
                }
            }
            ClientEvent::LoginRequired(LoginReason::ServerDeny) => {
                deny_seen = true;
                client.login("alice", "sesame", Allow::all());
            }
            ClientEvent::LoginCompleted { user } => {
                assert!(deny_seen, "wrong password must be denied first");
                assert_eq!(user, "alice");
                break;
            }
            _ => {}
        }
    }

    wait_until(|| client.connect_status() == Some(ConnectStat::Connected), "normal sync").await;
    drop(client);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reconnect_edges_and_resync() {
    let server_reg = Registry::new();
    let client_reg = Registry::new();
    let server = start_server(&server_reg).await;
    let client = connected_client(&server, &client_reg).await;

    let item = Handle::open(&client_reg, "/Test/r").unwrap();
    item.set_int(1);
    wait_until(|| server_reg.get_int("/Test/r") == Some(1), "first sync").await;
    assert!(!client.is_re_contact());
    assert!(!client.is_re_connect());

    // Drop the link from the client side and reconnect.
    client.close();
    wait_until(
        || {
            matches!(
                client.connect_status(),
                Some(ConnectStat::Disconnected) | Some(ConnectStat::Error)
            )
        },
        "disconnect",
    )
    .await;

    // Updates during the outage arrive after reconnect; several writes
    // coalesce into the final value.
    item.set_int(5);
    item.set_int(6);
    item.set_int(7);

    client.set_auto_connect(true, 1);
    let addr = server.local_addr();
    client.connect_to_host(&addr.ip().to_string(), addr.port());

    wait_until(|| server_reg.get_int("/Test/r") == Some(7), "resync after reconnect").await;
    assert!(client.is_re_contact());
    assert!(client.is_re_connect());

    drop(client);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_explicit_share_without_mount() {
    let server_reg = Registry::new();
    let client_reg = Registry::new();
    let server = start_server(&server_reg).await;

    let client = Client::new(&client_reg);
    client.set_auto_connect(true, 1);
    let addr = server.local_addr();
    client.connect_to_host(&addr.ip().to_string(), addr.port());
    wait_until(|| client.connect_status() == Some(ConnectStat::Connected), "connected").await;

    let item = Handle::open(&client_reg, "/Solo/value").unwrap();
    client.new_net_item("/Solo/value", SyncMode::empty()).await.unwrap();
    item.set_string("shared");

    wait_until(
        || server_reg.get_string("/Solo/value").as_deref() == Some("shared"),
        "explicit share",
    )
    .await;

    drop(client);
}
