use std::env;

use anyhow::{Context, Result};

use crate::config::RunConfig;

mod config;
mod run;

fn main() -> Result<()> {
    env_logger::init();

    let path = env::args()
        .nth(1)
        .or_else(|| env::var("HITS_CONFIG").ok())
        .context("usage: hits_trainer <config.json>, or set HITS_CONFIG")?;

    let config = RunConfig::from_file(&path)?;
    run::run(config)
}
