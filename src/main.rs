//! Ping-pong test driver for the shared-memory channel.
//!
//! The client sends `rounds` PING records carrying a round id and a send
//! timestamp; the server echoes each one back as a PONG. The client
//! verifies that ids arrive strictly in order, measures the round trip
//! from the echoed timestamp, and writes a human-readable report plus a
//! single-row CSV. Exits 0 on completion and 1 on setup failure.

use std::io::Write;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use shm_duplex::{ChannelConfig, LatencyStats, ShmClient, ShmServer, mono_time_ns};

/// Fixed record size used by the drivers.
const RECORD_SIZE: usize = 268;

/// Hard ceiling on a whole run, mirroring the channel's role as a
/// liveness-checked transport: a wedged peer must not hang the driver.
const MAX_RUN: Duration = Duration::from_secs(300);

#[derive(Parser, Debug)]
#[command(version, about = "Ping-pong driver for the shm-duplex channel", long_about = None)]
struct Args {
    /// Channel name shared by both sides.
    #[arg(short = 'c', long = "channel", default_value = "test_channel")]
    channel: String,

    /// Number of ping-pong rounds.
    #[arg(short = 'n', long = "rounds", default_value_t = 10_000)]
    rounds: u64,

    /// Ring payload size in bytes (server side only; rounded up to a
    /// power of two).
    #[arg(short = 's', long = "size", default_value_t = 1 << 20)]
    size: u32,

    /// Write the single-row CSV report to this file.
    #[arg(long = "csv")]
    csv: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Creates the channel and echoes every PING back as a PONG.
    Server,

    /// Connects to the channel, drives the rounds, and reports latency.
    Client,

    /// Runs both roles as threads in this process.
    Both,
}

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let config = ChannelConfig {
        size: args.size,
        blocking: true,
        timeout_ms: 1000,
        ..ChannelConfig::default()
    };

    let status = match args.command {
        Commands::Server => run_server(&args.channel, &config, args.rounds),
        Commands::Client => run_client(&args.channel, &config, args.rounds, args.csv.as_deref()),
        Commands::Both => {
            let name = args.channel.clone();
            let server_config = config.clone();
            let rounds = args.rounds;
            let server = std::thread::spawn(move || run_server(&name, &server_config, rounds));

            let client =
                run_client(&args.channel, &config, args.rounds, args.csv.as_deref());
            let server = server.join().unwrap_or(1);
            client.max(server)
        }
    };

    std::process::exit(status);
}

fn encode_record(id: u64, timestamp: u64, buf: &mut [u8; RECORD_SIZE]) {
    buf[..8].copy_from_slice(&id.to_le_bytes());
    buf[8..16].copy_from_slice(&timestamp.to_le_bytes());
}

fn decode_record(buf: &[u8]) -> (u64, u64) {
    let id = u64::from_le_bytes(buf[..8].try_into().unwrap());
    let timestamp = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    (id, timestamp)
}

fn run_server(name: &str, config: &ChannelConfig, rounds: u64) -> i32 {
    let mut server = match ShmServer::create(name, config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("server setup failed: {e}");
            return 1;
        }
    };

    println!("server: channel {name:?}, waiting for client");
    let deadline = Instant::now() + MAX_RUN;
    let mut buf = [0u8; RECORD_SIZE];
    let mut echoed = 0u64;
    let mut last_id: Option<u64> = None;

    while echoed < rounds {
        if Instant::now() >= deadline {
            eprintln!("server: gave up after {}s", MAX_RUN.as_secs());
            return 1;
        }

        let n = match server.receive(&mut buf) {
            Ok(n) => n,
            Err(shm_duplex::ShmError::Timeout) | Err(shm_duplex::ShmError::Empty) => continue,
            Err(e) => {
                eprintln!("server receive failed: {e}");
                return 1;
            }
        };
        if n != RECORD_SIZE {
            eprintln!("server: unexpected record size {n}");
            return 1;
        }

        let (id, _) = decode_record(&buf);
        if let Some(prev) = last_id {
            if id != prev + 1 {
                eprintln!("server: out-of-order id {id} after {prev}");
                return 1;
            }
        }
        last_id = Some(id);

        // The PONG keeps the original timestamp so the client can compute
        // the full round trip.
        if let Err(e) = server.send(&buf) {
            eprintln!("server send failed: {e}");
            return 1;
        }
        echoed += 1;
    }

    println!("server: echoed {echoed} records, ids in order");
    0
}

fn run_client(
    name: &str,
    config: &ChannelConfig,
    rounds: u64,
    csv: Option<&std::path::Path>,
) -> i32 {
    let mut client = match ShmClient::connect_with(name, config) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("client setup failed: {e}");
            return 1;
        }
    };

    println!("client: channel {name:?}, {rounds} rounds of {RECORD_SIZE}-byte records");
    let deadline = Instant::now() + MAX_RUN;
    let mut stats = LatencyStats::with_capacity(rounds as usize);
    let mut ping = [0u8; RECORD_SIZE];
    let mut pong = [0u8; RECORD_SIZE];

    for id in 0..rounds {
        encode_record(id, mono_time_ns(), &mut ping);
        if let Err(e) = client.send(&ping) {
            eprintln!("client send failed: {e}");
            return 1;
        }

        let n = loop {
            if Instant::now() >= deadline {
                eprintln!("client: gave up after {}s", MAX_RUN.as_secs());
                return 1;
            }
            match client.receive(&mut pong) {
                Ok(n) => break n,
                Err(shm_duplex::ShmError::Timeout) | Err(shm_duplex::ShmError::Empty) => continue,
                Err(e) => {
                    eprintln!("client receive failed: {e}");
                    return 1;
                }
            }
        };
        if n != RECORD_SIZE {
            eprintln!("client: unexpected record size {n}");
            return 1;
        }

        let (echoed_id, sent_at) = decode_record(&pong);
        if echoed_id != id {
            eprintln!("client: expected id {id}, got {echoed_id}");
            return 1;
        }
        stats.record_since(sent_at);
    }

    print!("{}", stats.report("round trip"));

    if let Some(path) = csv {
        let mut row = String::new();
        row.push_str(&LatencyStats::csv_header());
        row.push('\n');
        row.push_str(&stats.csv_row("pingpong"));
        row.push('\n');
        if let Err(e) = std::fs::File::create(path).and_then(|mut f| f.write_all(row.as_bytes())) {
            eprintln!("client: writing CSV to {} failed: {e}", path.display());
            return 1;
        }
        println!("client: CSV written to {}", path.display());
    }

    0
}
