//! Signal grid backtest binary
//!
//! Replays historical bars through every configured grid against the
//! matching simulator and prints a summary.
//!
//! ```bash
//! cargo run --bin grid_backtest -- backtest.toml
//! ```

use std::path::Path;

use log::{error, info};

use signal_grid::{runner::BacktestRunner, SignalRegistry};

#[tokio::main]
async fn main() {
    // Load .env file
    match dotenvy::dotenv() {
        Ok(path) => eprintln!("Loaded environment from: {}", path.display()),
        Err(_) => eprintln!("No .env file found, using system environment variables"),
    }

    let args: Vec<String> = std::env::args().collect();
    let config_path = args.get(1).map(String::as_str).unwrap_or("backtest.toml");
    if !Path::new(config_path).exists() {
        eprintln!("Config file '{}' not found. Please create one.", config_path);
        std::process::exit(1);
    }

    let runner = match BacktestRunner::new(config_path, SignalRegistry::with_defaults()) {
        Ok(runner) => runner,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    match runner.run().await {
        Ok(summary) => {
            info!("Backtest complete");
            match serde_json::to_string_pretty(&summary) {
                Ok(json) => println!("{}", json),
                Err(e) => error!("Failed to encode summary: {}", e),
            }
        }
        Err(e) => {
            error!("Backtest failed: {}", e);
            eprintln!("Backtest execution error: {}", e);
            std::process::exit(1);
        }
    }
}
