//! Entry point for the `dccp` demo endpoint.
//!
//! Parses CLI arguments and dispatches into either **server** (echo) or
//! **client** mode.  All protocol work is delegated to library modules;
//! `main.rs` owns only process setup (logging, argument parsing).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use dccp_over_udp::ccid::{FixedRateSender, NopReceiver};
use dccp_over_udp::link::UdpLink;
use dccp_over_udp::mux::Mux;
use dccp_over_udp::{Conn, Env, HeaderConn};

/// Service code the demo endpoints agree on.
const ECHO_SERVICE: u32 = 0x4543_484f; // "ECHO"

/// Demo packet rate for the stand-in congestion control.
const PACKETS_PER_SEC: u32 = 100;

/// Congestion-controlled datagram echo over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run as an echo server, accepting incoming connections.
    Server {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: String,
    },
    /// Run as a client, sending one message and printing the echo.
    Client {
        /// Remote server address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        server: String,
        /// Message to send.
        #[arg(short, long, default_value = "ping")]
        message: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    match cli.mode {
        Mode::Server { bind } => serve(&bind).await,
        Mode::Client { server, message } => run_client(&server, message).await,
    }
}

async fn serve(bind: &str) -> Result<()> {
    let addr: SocketAddr = bind.parse().context("bad bind address")?;
    let env = Env::real();
    let link = UdpLink::bind(addr).await.context("bind UDP link")?;
    log::info!("echo server on {}", link.local_addr);
    let mux = Mux::new(&env, Arc::new(link));

    loop {
        let flow = match mux.accept().await {
            Ok(f) => f,
            Err(e) => {
                log::warn!("accept failed: {e}");
                return Ok(());
            }
        };
        let conn = Conn::server(
            &env,
            HeaderConn::new(flow),
            Arc::new(FixedRateSender::new(env.clone(), PACKETS_PER_SEC)),
            Arc::new(NopReceiver),
        );
        env.go("echo-session", async move {
            loop {
                match conn.read_segment().await {
                    Ok(payload) => {
                        log::info!("echoing {} bytes", payload.len());
                        if conn.write_segment(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::info!("session over: {e}");
                        break;
                    }
                }
            }
        });
    }
}

async fn run_client(server: &str, message: String) -> Result<()> {
    let server_addr: SocketAddr = server.parse().context("bad server address")?;
    let env = Env::real();
    let link = UdpLink::bind("0.0.0.0:0".parse::<SocketAddr>().unwrap())
        .await
        .context("bind UDP link")?;
    let mux = Mux::new(&env, Arc::new(link));

    let flow = mux.dial(Some(server_addr)).context("dial")?;
    let conn = Conn::client(
        &env,
        HeaderConn::new(flow),
        Arc::new(FixedRateSender::new(env.clone(), PACKETS_PER_SEC)),
        Arc::new(NopReceiver),
        ECHO_SERVICE,
    );

    conn.write_segment(message.into_bytes())
        .await
        .context("send")?;
    let echo = conn.read_segment().await.context("receive echo")?;
    println!("{}", String::from_utf8_lossy(&echo));

    conn.close().ok();
    Ok(())
}
