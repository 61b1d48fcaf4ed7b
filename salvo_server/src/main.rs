// CLI entry point for the salvo game server.
//
// Starts a standalone server that players connect to with any line-based
// client. See `server.rs` for the networking architecture and `session.rs`
// for the turn engine.
//
// Usage:
//   salvo-server [OPTIONS]
//     --config <PATH>         JSON config file (applied before other flags)
//     --port <PORT>           Listen port (default: 9001)
//     --players <N>           Players per session, 2-8 (default: 4)
//     --hit-points <N>        Starting hit points, 0-9 (default: 1)
//     --damage <N>            Damage per hit (default: 1)
//     --scan-distance <N>     Scan radius (default: 1)
//     --no-scan-near-ship     Do not sweep around the player's own ship
//     --timeout-secs <N>      Idle connection timeout (default: 30)
//
// Log verbosity follows `RUST_LOG` (default `info`).

use std::path::Path;
use std::process;
use std::str::FromStr;

use salvo_server::{ServerConfig, start_server};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = parse_args();

    let (handle, addr) = match start_server(config) {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "failed to start server");
            process::exit(1);
        }
    };

    info!(%addr, "ready; log in as the admin user and send Shutdown to stop");
    handle.wait();
    info!("server stopped");
}

/// Parse command-line arguments into a `ServerConfig`. Uses simple
/// `std::env::args()` matching; `--config` is loaded first wherever it
/// appears so the remaining flags override the file.
fn parse_args() -> ServerConfig {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut config = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let path = args.get(i + 1).unwrap_or_else(|| usage_error("--config requires a path"));
            ServerConfig::load(Path::new(path)).unwrap_or_else(|e| {
                eprintln!("{e}");
                process::exit(1);
            })
        }
        None => ServerConfig::default(),
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => i += 1,
            "--port" => {
                i += 1;
                config.port = value(&args, i, "--port");
            }
            "--players" => {
                i += 1;
                config.rules.players = value(&args, i, "--players");
            }
            "--hit-points" => {
                i += 1;
                config.rules.starting_hit_points = value(&args, i, "--hit-points");
            }
            "--damage" => {
                i += 1;
                config.rules.damage_per_hit = value(&args, i, "--damage");
            }
            "--scan-distance" => {
                i += 1;
                config.rules.scan_distance = value(&args, i, "--scan-distance");
            }
            "--no-scan-near-ship" => config.rules.scan_near_own_ship = false,
            "--timeout-secs" => {
                i += 1;
                let secs: u64 = value(&args, i, "--timeout-secs");
                config.connection_timeout_ms = secs.saturating_mul(1000);
            }
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                process::exit(1);
            }
        }
        i += 1;
    }

    config.rules = config.rules.normalized();
    config
}

/// Parse the flag value at `args[i]`, exiting with a usage error if it is
/// missing or malformed.
fn value<T: FromStr>(args: &[String], i: usize, flag: &str) -> T {
    args.get(i)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| usage_error(&format!("{flag} requires a valid value")))
}

fn usage_error(message: &str) -> ! {
    eprintln!("{message}");
    print_usage();
    process::exit(1);
}

fn print_usage() {
    println!("Usage: salvo-server [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --config <PATH>         JSON config file (applied before other flags)");
    println!("  --port <PORT>           Listen port (default: 9001)");
    println!("  --players <N>           Players per session, 2-8 (default: 4)");
    println!("  --hit-points <N>        Starting hit points, 0-9 (default: 1)");
    println!("  --damage <N>            Damage per hit (default: 1)");
    println!("  --scan-distance <N>     Scan radius (default: 1)");
    println!("  --no-scan-near-ship     Do not sweep around the player's own ship");
    println!("  --timeout-secs <N>      Idle connection timeout (default: 30)");
    println!("  --help, -h              Show this help");
}
