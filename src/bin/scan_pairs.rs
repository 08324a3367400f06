//! Offline pair discovery.
//!
//! Commands:
//! - `collect` — fetch complete price histories for every tradeable symbol
//!   and save them as a `{symbol: [candles]}` JSON dump
//! - `scan` — rank co-integrated pairs in such a dump and write them to CSV

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use statbot::analysis::cointegration::DEFAULT_P_VALUE_THRESHOLD;
use statbot::config::StatbotConfig;
use statbot::pairtrade::open_paper_gateway;
use statbot::scanner::{
    collect_price_histories, find_cointegrated_pairs, load_price_history, write_pairs_csv,
    write_price_history,
};
use statbot::trade::execution::gateway_box::GatewayBox;
use statbot::trade::gateway::SymbolFilter;

#[derive(Parser)]
#[command(
    name = "scan-pairs",
    about = "Collect price histories and find co-integrated symbol pairs"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch price histories through the configured gateway.
    ///
    /// Interval and depth come from the same config as the bot
    /// (`STATBOT_CONFIG_PATH` or environment variables).
    Collect {
        /// Where to write the JSON dump.
        #[arg(long, default_value = "1_price_histories.json")]
        output: PathBuf,

        /// Only symbols quoted in this currency.
        #[arg(long, default_value = "USDT")]
        quote: String,
    },
    /// Rank co-integrated pairs from a JSON dump.
    Scan {
        /// JSON file shaped as {symbol: [candles]}.
        #[arg(default_value = "1_price_histories.json")]
        history: PathBuf,

        /// Where to write the ranked pairs.
        #[arg(long, default_value = "2_cointegrated_pairs.csv")]
        output: PathBuf,

        /// Maximum p-value for a pair to count as co-integrated.
        #[arg(long, default_value_t = DEFAULT_P_VALUE_THRESHOLD)]
        p_threshold: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Collect { output, quote } => collect(output, quote).await,
        Commands::Scan {
            history,
            output,
            p_threshold,
        } => scan(history, output, p_threshold),
    }
}

async fn collect(output: PathBuf, quote: String) -> Result<()> {
    let cfg = StatbotConfig::from_env_or_yaml().context("invalid statbot config")?;
    let gateway = GatewayBox::new(open_paper_gateway(&cfg)?);
    let filter = SymbolFilter {
        trading_only: true,
        quote_currency: Some(quote),
    };

    let collection =
        collect_price_histories(&gateway, &filter, cfg.interval, cfg.history_depth).await;
    if collection.histories.is_empty() {
        bail!(
            "no complete price histories collected ({} failures)",
            collection.failures
        );
    }
    write_price_history(&output, &collection.histories)?;
    println!(
        "Saved prices to {} for {} symbols ({} failures)",
        output.display(),
        collection.successes,
        collection.failures
    );
    Ok(())
}

fn scan(history: PathBuf, output: PathBuf, p_threshold: f64) -> Result<()> {
    if !(p_threshold > 0.0 && p_threshold <= 1.0) {
        bail!("--p-threshold must be in (0, 1], got {}", p_threshold);
    }

    let histories = load_price_history(&history)?;
    let pairs = find_cointegrated_pairs(&histories, p_threshold);
    write_pairs_csv(&output, &pairs)?;
    println!(
        "{} co-integrated pairs written to {}",
        pairs.len(),
        output.display()
    );
    Ok(())
}
