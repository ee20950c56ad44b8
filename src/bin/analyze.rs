//! credfish-analyze: one-shot confidence analysis.
//!
//! Builds a confidence tree for a position (and optionally a candidate
//! move) against a live UCI engine, then prints the response as JSON on
//! stdout and a colored summary on stderr.
//!
//! # Usage
//!
//! ```bash
//! # Required: a UCI engine on PATH or via CREDFISH_ENGINE
//! export CREDFISH_ENGINE=/usr/bin/stockfish
//!
//! # Optional tuning
//! export CREDFISH_POOL_SIZE=2
//! export CREDFISH_DEEP_DEPTH=14
//! export CREDFISH_SHALLOW_DEPTH=6
//! export CREDFISH_TARGET=80
//!
//! credfish-analyze "<fen>" [move]
//! ```

use std::sync::Arc;

use colored::Colorize;
use dotenv::dotenv;
use log::info;

use credfish::{Config, Coordinator, EnginePool, RaiseRequest};

fn env_u8(key: &str) -> Option<u8> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: credfish-analyze \"<fen>\" [move]");
        eprintln!("Environment: CREDFISH_ENGINE, CREDFISH_TARGET, CREDFISH_BASELINE, ...");
        std::process::exit(2);
    }

    let request = RaiseRequest {
        fen: args[1].clone(),
        candidate: args.get(2).cloned(),
        target: env_u8("CREDFISH_TARGET"),
        baseline: env_u8("CREDFISH_BASELINE"),
    };

    let config = Config::from_env();
    info!(
        "config: engine='{}' pool={} depths={}/{} k={}",
        config.engine_binary_path,
        config.pool_size,
        config.deep_depth,
        config.shallow_depth,
        config.branching_k
    );

    let pool = match EnginePool::start(&config).await {
        Ok(pool) => Arc::new(pool),
        Err(error) => {
            eprintln!("Failed to start engine pool: {}", error);
            std::process::exit(1);
        }
    };

    let coordinator = Coordinator::new(Arc::clone(&pool) as Arc<dyn credfish::Analyse>, config);
    let result = coordinator.raise_confidence(request).await;
    pool.shutdown().await;

    match result {
        Ok(response) => {
            let summary = format!(
                "overall {}  line {}  nodes {}  exit {:?}",
                response.overall_confidence,
                response.line_confidence,
                response.nodes.len(),
                response.exit_reason
            );
            let colored_summary = if response.overall_confidence >= 80 {
                summary.green()
            } else if response.overall_confidence >= 50 {
                summary.yellow()
            } else {
                summary.red()
            };
            eprintln!("{}", colored_summary);

            match serde_json::to_string_pretty(&response) {
                Ok(json) => println!("{}", json),
                Err(error) => {
                    eprintln!("Serialization error: {}", error);
                    std::process::exit(1);
                }
            }
        }
        Err(error) => {
            eprintln!("{} {}", "Analysis failed:".red(), error);
            std::process::exit(1);
        }
    }
}
