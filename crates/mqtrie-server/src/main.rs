//! mqtrie - a durable MQTT-style publish/subscribe broker.

mod auth;
mod config;
mod conn;
mod error;
mod hash;
mod luid;
mod message;
mod ring;
mod server;
mod storage;
mod tcp;
mod topic;
mod trie;

use log::{error, info};

use crate::config::Config;
use crate::server::Server;

struct Args {
    config_path: String,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = "mqtrie.yaml".to_string();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                if i + 1 < args.len() {
                    config_path = args[i + 1].clone();
                    i += 2;
                } else {
                    eprintln!("Error: --config requires a file path");
                    std::process::exit(1);
                }
            }
            "--version" => {
                println!("mqtrie {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("mqtrie - durable MQTT-style publish/subscribe broker");
                println!();
                println!("Usage: mqtrie [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <FILE>     Config file path (default: mqtrie.yaml)");
                println!("      --version           Print version and exit");
                println!("  -h, --help              Show this help message");
                println!();
                println!("The config file is YAML; see the config module docs for keys.");
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                eprintln!("Use --help for usage information");
                std::process::exit(1);
            }
        }
    }

    Args { config_path }
}

fn main() {
    let args = parse_args();

    let config = match Config::load(&args.config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.log_level),
    )
    .init();

    info!(
        "starting mqtrie (tcp={}, http={}, heartbeat={}ms, maxMsgSize={})",
        config.tcp_address,
        config.http_address,
        config.heartbeat_timeout,
        config.max_msg_size
    );

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start server: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
