//! Chat demo, server side: hosts the registry with a chat pipe and an
//! optional account table loaded from a toml config.

use clap::Parser;
use serde::Deserialize;
use synctree::{Allow, Handle, LoginTable, Monitor, Registry, Server, ServerConfig};

#[derive(Parser)]
#[command(about = "synctree chat demo server")]
struct Args {
    /// Path to a toml config file.
    #[arg(long)]
    config: Option<String>,
    /// Bind address, overrides the config.
    #[arg(long)]
    bind: Option<String>,
    /// TCP port, overrides the config.
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    bind: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    users: Vec<UserConfig>,
}

#[derive(Deserialize)]
struct UserConfig {
    name: String,
    password: String,
    #[serde(default)]
    read_only: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config: Config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path).expect("read config file");
            toml::from_str(&raw).expect("parse config file")
        }
        None => Config::default(),
    };

    let mut login_table = LoginTable::new();
    for user in &config.users {
        let allow = if user.read_only { Allow::READ } else { Allow::all() };
        login_table.add_access(&user.name, &user.password, allow);
    }

    let registry = Registry::new();

    // The chat room: a pipe every participant writes into and listens on.
    let room = Handle::open(&registry, "/Chat/room").unwrap();
    room.set_pipe_mode();

    let mut who = synctree::wire::RecordMap::new();
    who.add_str("Agent", "chat_server");
    let server_cfg = ServerConfig {
        bind_addr: args.bind.or(config.bind).unwrap_or_else(|| "0.0.0.0".to_string()),
        port: args.port.or(config.port).unwrap_or(synctree::path::DEFAULT_TCP_PORT),
        login_table,
        who_i_am: who,
        ..Default::default()
    };
    let server = Server::bind(&registry, server_cfg).await.expect("bind server");
    println!("chat server listening on {}", server.local_addr());

    // Print the room traffic and watch clients coming and going.
    let listen = Handle::open(&registry, "/Chat/room!").unwrap();
    listen.set_on_event_any_thread(std::sync::Arc::new(|ev| {
        if let synctree::LinkEvent::ValueChanged { value_data: Some(data), .. } = ev {
            let text = match data.first() {
                Some(&b) if b < 32 => &data[1..],
                _ => &data[..],
            };
            println!("room: {}", String::from_utf8_lossy(text));
        }
    }));

    let mut sessions = Monitor::new(&registry);
    sessions.set_on_item_created(Box::new(|path| println!("session up: {path}")));
    sessions.set_on_item_deleted(Box::new(|path| println!("session down: {path}")));
    sessions.start_local("/Local/Sys/Server/Sessions/").unwrap();

    tokio::signal::ctrl_c().await.expect("ctrl-c");
    println!("shutting down");
}
