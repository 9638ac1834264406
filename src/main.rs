// webmuxd: serve local usbmuxd clients against devices attached to a
// remote agent reached over WebSocket.

use clap::{Arg, Command};
use tokio::net::{TcpListener, UnixListener};
use tracing::info;

use webmuxd::hub::{self, Hub};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let matches = Command::new("webmuxd")
        .about("Bridge local usbmuxd clients to remotely attached devices")
        .arg(
            Arg::new("socket")
                .long("socket")
                .value_name("PATH")
                .default_value("/tmp/remote_usbmuxd.sock")
                .help("Local unix socket to listen on"),
        )
        .arg(
            Arg::new("listen")
                .long("listen")
                .value_name("HOST")
                .default_value("127.0.0.1")
                .help("Bind host for the agent endpoint"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("PORT")
                .default_value("8080")
                .value_parser(clap::value_parser!(u16))
                .help("Bind port for the agent endpoint"),
        )
        .get_matches();

    let socket_path = matches
        .get_one::<String>("socket")
        .expect("defaulted")
        .clone();
    let host = matches.get_one::<String>("listen").expect("defaulted");
    let port = *matches.get_one::<u16>("port").expect("defaulted");

    // A stale socket file from a previous run would fail the bind.
    if let Err(e) = tokio::fs::remove_file(&socket_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            eprintln!("Unable to remove {socket_path}: {e}");
            std::process::exit(1);
        }
    }

    let local_listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Unable to listen on {socket_path}: {e}");
            std::process::exit(1);
        }
    };
    info!(socket = %socket_path, "local socket opened");

    let bind = format!("{host}:{port}");
    let remote_listener = match TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Unable to listen on {bind}: {e}");
            std::process::exit(1);
        }
    };
    info!(%bind, "agent endpoint opened");

    let (hub_loop, hub) = Hub::new();
    tokio::task::spawn(hub_loop.run());
    tokio::task::spawn(hub::run_local_listener(local_listener, hub.clone()));
    tokio::task::spawn(hub::run_remote_listener(remote_listener, hub.clone()));

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("Unable to wait for the shutdown signal: {e}");
        std::process::exit(1);
    }
    info!("shutting down");
    let _ = hub.shutdown().await;
    let _ = tokio::fs::remove_file(&socket_path).await;
}
