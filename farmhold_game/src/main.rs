// CLI entry point for the Farmhold game.
//
// Runs the headless authoritative server, a headless client, or both in
// one process for local testing. The client here is the minimal driver: it
// announces a name, readies up as soon as the server assigns it an id, and
// then just keeps the replicated world current until the connection drops.
//
// Usage:
//   farmhold server [--port <PORT>]
//   farmhold client <NAME> [--addr <ADDR>]
//   farmhold both [--port <PORT>]

use std::sync::atomic::AtomicBool;
use std::thread;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use farmhold_game::client::GameClient;
use farmhold_game::server::{GameConfig, GameServer, TICK, start_server};

enum Command {
    Server { port: u16 },
    Client { name: String, addr: String },
    Both { port: u16 },
}

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match parse_args() {
        Command::Server { port } => run_server(port),
        Command::Client { name, addr } => run_client(&name, &addr),
        Command::Both { port } => run_both(port),
    }
}

fn run_server(port: u16) {
    let mut server = GameServer::new(GameConfig {
        port,
        ..GameConfig::default()
    });
    let addr = match server.start() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("Failed to start server: {e}");
            std::process::exit(1);
        }
    };
    println!("Server listening on {addr}");

    // Runs until the process is killed.
    server.run(&AtomicBool::new(true));
}

fn run_client(name: &str, addr: &str) {
    let mut client = GameClient::new(name);
    if let Err(e) = client.start(addr) {
        eprintln!("Failed to connect to {addr}: {e}");
        std::process::exit(1);
    }
    println!("Connected to {addr} as {name:?}");

    let mut sent_ready = false;
    while !client.connection_lost() {
        client.tick();
        if !sent_ready && client.my_id().is_some() {
            client.send_ready(true);
            sent_ready = true;
        }
        thread::sleep(TICK);
    }
    println!("Connection closed.");
    client.stop();
}

fn run_both(port: u16) {
    let config = GameConfig {
        port,
        ..GameConfig::default()
    };
    let (handle, addr) = match start_server(config) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Failed to start server: {e}");
            std::process::exit(1);
        }
    };
    println!("Server listening on {addr}");

    run_client("Host", &addr.to_string());
    handle.stop();
}

/// Parse command-line arguments. Uses simple `std::env::args()` matching —
/// no clap dependency.
fn parse_args() -> Command {
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;

    let role = args.get(i).cloned().unwrap_or_else(|| {
        print_usage();
        std::process::exit(1);
    });
    i += 1;
    if role == "--help" || role == "-h" {
        print_usage();
        std::process::exit(0);
    }

    let mut name = String::new();
    if role == "client" {
        name = args.get(i).cloned().unwrap_or_else(|| {
            eprintln!("client requires a display name");
            std::process::exit(1);
        });
        i += 1;
    }

    let mut port = 7878;
    let mut addr = "127.0.0.1:7878".to_string();
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                port = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--port requires a valid port number");
                    std::process::exit(1);
                });
            }
            "--addr" => {
                i += 1;
                addr = args.get(i).cloned().unwrap_or_else(|| {
                    eprintln!("--addr requires a value");
                    std::process::exit(1);
                });
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    match role.as_str() {
        "server" => Command::Server { port },
        "client" => Command::Client { name, addr },
        "both" => Command::Both { port },
        other => {
            eprintln!("Unknown role: {other}");
            print_usage();
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!("Usage: farmhold <ROLE> [OPTIONS]");
    println!();
    println!("Roles:");
    println!("  server            Run the authoritative server");
    println!("  client <NAME>     Connect to a server as NAME");
    println!("  both              Run a server and a local client in one process");
    println!();
    println!("Options:");
    println!("  --port <PORT>     Listen port for server/both (default: 7878)");
    println!("  --addr <ADDR>     Server address for client (default: 127.0.0.1:7878)");
    println!("  --help, -h        Show this help");
}
