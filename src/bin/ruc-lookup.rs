//! One-shot / batch RUC lookup against the live portal, without the HTTP layer.
//!
//! Usage:
//!   ruc-lookup 20106897914 20100039207
//!   ruc-lookup --file rucs.txt
//!
//! Prints one JSON object per RUC on stdout: the record, or
//! `{"ruc": ..., "error": ..., "kind": ...}`. Exit code 1 if any lookup failed.

use anyhow::{bail, Context};
use std::sync::Arc;

use sunat_scout::config::load_scout_config;
use sunat_scout::{ChromeLauncher, LookupService};

fn collect_keys() -> anyhow::Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--file" {
            let path = args.next().context("--file needs a path")?;
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path))?;
            keys.extend(
                contents
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_string),
            );
        } else {
            let arg = arg.trim();
            if !arg.is_empty() {
                keys.push(arg.to_string());
            }
        }
    }
    if keys.is_empty() {
        bail!("usage: ruc-lookup <RUC>... [--file PATH]");
    }
    Ok(keys)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let keys = collect_keys()?;
    let settings = load_scout_config().settings();
    let launcher = Arc::new(ChromeLauncher::new(settings.browser.clone()));
    let service = LookupService::new(&settings, launcher);

    let mut failures = 0usize;
    for key in keys {
        let line = match service.lookup(&key).await {
            Ok(outcome) => serde_json::to_string(outcome.record())?,
            Err(e) => {
                failures += 1;
                serde_json::json!({
                    "ruc": key,
                    "error": e.to_string(),
                    "kind": e.kind().as_str(),
                })
                .to_string()
            }
        };
        println!("{}", line);
    }

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}
