//! Chat demo, client side: joins the chat room on a server and bridges it
//! to the terminal.

use std::sync::Arc;

use clap::Parser;
use synctree::{Allow, Client, ClientConfig, ClientEvent, Handle, LinkEvent, Registry};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(about = "synctree chat demo client")]
struct Args {
    /// Server host name or address.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Server TCP port.
    #[arg(long, default_value_t = synctree::path::DEFAULT_TCP_PORT)]
    port: u16,
    /// Nick name shown in the room.
    #[arg(long, default_value = "anon")]
    nick: String,
    /// Login user, when the server demands one.
    #[arg(long)]
    user: Option<String>,
    /// Login password.
    #[arg(long)]
    pass: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let registry = Registry::new();

    let mut who = synctree::wire::RecordMap::new();
    who.add_str("Agent", "chat_client").add_str("Name", &args.nick);
    let client = Client::with_config(
        &registry,
        ClientConfig { who_i_am: who, ..Default::default() },
    );
    client.set_auto_connect(true, 2);
    assert!(client.add_mount_point("/Chat/", "").await);

    // Everything arriving in the room is printed; own lines echo back too.
    let listen = Handle::open(&registry, "/Chat/room!").unwrap();
    listen.set_on_event_any_thread(Arc::new(|ev: &LinkEvent| {
        if let LinkEvent::ValueChanged { value_data: Some(data), .. } = ev {
            let text = match data.first() {
                Some(&b) if b < 32 => &data[1..],
                _ => &data[..],
            };
            println!("{}", String::from_utf8_lossy(text));
        }
    }));

    let room = Handle::open(&registry, "/Chat/room").unwrap();
    room.set_pipe_mode();

    // Status and login handling in the background.
    let events = client.events();
    let login_client = client.clone();
    let (user, pass) = (args.user.clone(), args.pass.clone());
    tokio::spawn(async move {
        while let Ok(ev) = events.recv().await {
            match ev {
                ClientEvent::ConnectionStatus { stat, .. } => {
                    eprintln!("[status: {:?}]", stat);
                }
                ClientEvent::LoginRequired(reason) => match (&user, &pass) {
                    (Some(user), Some(pass)) => {
                        eprintln!("[login as {} ({:?})]", user, reason);
                        login_client.login(user, pass, Allow::all());
                    }
                    _ => eprintln!("[server demands login, pass --user/--pass]"),
                },
                ClientEvent::LoginCompleted { user } => {
                    eprintln!("[logged in as {}]", user);
                }
                ClientEvent::ChatReceived { text, .. } => {
                    eprintln!("[server: {}]", text);
                }
                ClientEvent::KillRequested => {
                    eprintln!("[server kicked us]");
                }
                _ => {}
            }
        }
    });

    client.connect_to_host(&args.host, args.port);
    println!("joined {}:{} as {}; type to chat", args.host, args.port, args.nick);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }
        room.set_string(&format!("{}: {}", args.nick, line));
    }

    client.close();
}
