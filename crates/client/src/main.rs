use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;

use slipstream::{ClientSession, DEFAULT_PORT, DEFAULT_TICK_RATE, DemoWorld, UdpTransport};

#[derive(Parser)]
#[command(name = "slipstream-client")]
#[command(about = "Slipstream demo client")]
struct Args {
    #[arg(short, long, default_value = "127.0.0.1")]
    server: String,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// How many ticks to run before a clean disconnect.
    #[arg(short, long, default_value_t = 600)]
    ticks: u32,

    #[arg(short = 'r', long, default_value_t = DEFAULT_TICK_RATE)]
    tick_rate: u32,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let server_addr: SocketAddr = format!("{}:{}", args.server, args.port)
        .parse()
        .context("bad server address")?;
    let transport = UdpTransport::bind("0.0.0.0:0").context("binding local socket")?;

    let mut session = ClientSession::new(transport, DemoWorld::new(1), server_addr)?;
    log::info!("connecting to {}", server_addr);

    let tick_duration = Duration::from_secs_f64(1.0 / args.tick_rate as f64);
    let mut was_connected = false;

    for tick in 0..args.ticks {
        if session.has_failed() {
            bail!(
                "connection failed: {}",
                session.fail_reason().unwrap_or("no reason")
            );
        }
        if session.is_connected() && !was_connected {
            was_connected = true;
            log::info!("connected, session {}", session.session_id().unwrap_or(0));
            session.request_info();
        }
        if let Some(handle) = session.handle() {
            // keep the local state moving so deltas have something to carry
            session.sim_mut().nudge(handle, tick as i32);
        }
        session.tick();
        std::thread::sleep(tick_duration);
    }

    if let Some(info) = session.server_info() {
        log::info!("server info: {}", String::from_utf8_lossy(info));
    }

    session.disconnect("Client quit");
    session.tick();

    let stats = session.stats().clone();
    log::info!(
        "done: in {} pkts / {} B, out {} pkts / {} B",
        stats.packets_received,
        stats.bytes_received,
        stats.packets_sent,
        stats.bytes_sent,
    );
    Ok(())
}
