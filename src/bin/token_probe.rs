//! Credential check
//!
//! Validates the stored marketplace credential, optionally storing a pasted
//! one first, and prints a sample of the latest purchases.
//!
//! Usage:
//!   cargo run --bin token_probe
//!   cargo run --bin token_probe -- --token "tma query_id=..." --limit 3

use anyhow::{bail, Context, Result};
use gift_sale_monitor::engine::config::MonitorConfig;
use gift_sale_monitor::engine::format::format_timestamp;
use gift_sale_monitor::engine::market::{MarketClient, MarketFeed};
use gift_sale_monitor::engine::token::TokenStore;

#[derive(Debug)]
struct Args {
    token: Option<String>,
    limit: usize,
}

fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().collect();
    let mut token = None;
    let mut limit = 5usize;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--token" | "-t" => {
                i += 1;
                let Some(v) = args.get(i) else {
                    bail!("--token needs a value");
                };
                token = Some(v.clone());
            }
            "--limit" | "-n" => {
                i += 1;
                let Some(v) = args.get(i) else {
                    bail!("--limit needs a value");
                };
                limit = v.parse().with_context(|| format!("bad --limit {v}"))?;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }
    Ok(Args { token, limit })
}

fn print_help() {
    println!(
        r#"token_probe - check the marketplace credential

USAGE:
    token_probe [--token <value>] [--limit <n>]

OPTIONS:
    -t, --token <value>   Store this credential before probing ('tma ' is added if missing)
    -n, --limit <n>       Number of purchases to fetch (default 5)
    -h, --help            Show this help
"#
    );
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();

    match probe().await {
        Ok(()) => {}
        Err(e) => {
            eprintln!("FAILED: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn probe() -> Result<()> {
    let args = parse_args()?;
    let cfg = MonitorConfig::from_env();
    let mut store = TokenStore::new(&cfg.token_file, cfg.token_policy());

    if let Some(raw) = args.token.as_deref() {
        store.accept_observed(raw)?;
        println!("stored credential in {}", store.path().display());
    } else if !store.load_persisted()? {
        bail!("no credential in {}", store.path().display());
    }
    let Some(token) = store.get_current().map(str::to_string) else {
        bail!("no usable credential");
    };
    if let Some(age) = store.age(chrono::Utc::now()) {
        println!("credential age: {}s", age.as_secs());
    }

    let client = MarketClient::new(&cfg.api_url, 1, cfg.request_timeout)?;
    let sales = client
        .fetch_latest(&token, args.limit)
        .await
        .context("marketplace call")?;

    println!("OK: {} purchase(s) returned", sales.len());
    for sale in sales.iter().take(args.limit) {
        println!(
            "  {} #{}  {} TON  ({})",
            sale.name,
            sale.external_number,
            sale.amount.normalize(),
            format_timestamp(&sale.created_at)
        );
    }
    Ok(())
}
