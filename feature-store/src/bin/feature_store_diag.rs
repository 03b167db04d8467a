// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::{env, path::PathBuf, process};

use core_types::{ConfigError, EngineConfig};
use feature_store::{validate, FeatureStore, FeatureStoreError};

fn main() {
    tracing_subscriber::fmt::init();
    match run() {
        Ok(true) => {}
        Ok(false) => process::exit(2),
        Err(err) => {
            eprintln!("feature_store_diag failed: {err}");
            process::exit(1);
        }
    }
}

fn run() -> Result<bool, DiagError> {
    let config = EngineConfig::load()?;
    let args = CliArgs::parse(&config)?;
    let store = FeatureStore::new(&args.root, &args.market);
    let report = validate(&store)?;

    let instruments = store.load_instruments()?;
    let calendar_len = store.load_calendar()?.map(|c| c.len()).unwrap_or(0);
    println!(
        "store {} (market={}): {} instruments, {} calendar dates, {} files checked",
        args.root.display(),
        args.market,
        instruments.len(),
        calendar_len,
        report.files_checked
    );
    if report.is_clean() {
        println!("no violations");
        return Ok(true);
    }
    println!("{} violation(s):", report.violations.len());
    for violation in &report.violations {
        println!("  {violation}");
    }
    Ok(false)
}

struct CliArgs {
    root: PathBuf,
    market: String,
}

impl CliArgs {
    fn parse(config: &EngineConfig) -> Result<Self, DiagError> {
        let mut root = None;
        let mut market = config.market.clone();
        for arg in env::args().skip(1) {
            if let Some(value) = arg.strip_prefix("--market=") {
                market = value.to_string();
            } else if arg.starts_with("--") || root.is_some() {
                return Err(DiagError::UnknownArg(arg));
            } else {
                root = Some(PathBuf::from(arg));
            }
        }
        Ok(Self {
            root: root.unwrap_or_else(|| config.feature_root.clone()),
            market,
        })
    }
}

#[derive(thiserror::Error, Debug)]
enum DiagError {
    #[error(transparent)]
    Store(#[from] FeatureStoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unknown argument: {0}")]
    UnknownArg(String),
}
