mod config;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use config::ServerConfig;
use slipstream::{DEFAULT_PORT, DemoWorld, ServerSession, UdpTransport};

#[derive(Parser)]
#[command(name = "slipstream-server")]
#[command(about = "Slipstream session server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(short, long)]
    tick_rate: Option<u32>,

    #[arg(short, long)]
    max_peers: Option<usize>,

    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(tick_rate) = args.tick_rate {
        config.tick_rate = tick_rate;
    }
    if let Some(max_peers) = args.max_peers {
        config.max_peers = max_peers;
    }

    let bind_addr = format!("{}:{}", args.bind, args.port);
    let transport = UdpTransport::bind(&bind_addr).with_context(|| format!("binding {}", bind_addr))?;
    log::info!("listening on {}", transport.local_addr());

    let mut session = ServerSession::new(transport, DemoWorld::new(config.max_peers))?;

    let tick_duration = Duration::from_secs_f64(1.0 / config.tick_rate as f64);
    let stats_interval = Duration::from_secs(config.stats_interval_secs);
    let mut last_tick = Instant::now();
    let mut accumulator = Duration::ZERO;
    let mut last_stats = Instant::now();
    let mut step = 0i32;

    loop {
        let now = Instant::now();
        accumulator += now - last_tick;
        last_tick = now;

        while accumulator >= tick_duration {
            accumulator -= tick_duration;
            step = step.wrapping_add(1);
            for handle in session.sim().handles() {
                session.sim_mut().nudge(handle, step);
            }
            session.tick();
        }

        if last_stats.elapsed() >= stats_interval {
            last_stats = Instant::now();
            let peers = session.connected_count();
            let stats = session.stats().clone();
            log::info!(
                "peers {} | in {} pkts / {} B | out {} pkts / {} B | dropped {}",
                peers,
                stats.packets_received,
                stats.bytes_received,
                stats.packets_sent,
                stats.bytes_sent,
                stats.packets_dropped,
            );
        }

        std::thread::sleep(Duration::from_millis(1));
    }
}
