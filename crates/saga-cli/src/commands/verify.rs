//! `saga verify` - full-journal integrity check.

use anyhow::{Context, Result};
use saga_core::config::SagaConfig;
use saga_core::context::CallContext;

use super::{Access, open_store};

pub fn run(config: &SagaConfig) -> Result<()> {
    let store = open_store(config, Access::Signed)?;
    let report = store
        .verify_event_integrity(&CallContext::background())
        .context("journal verification failed")?;
    println!(
        "verified {} events across {} campaigns",
        report.events, report.campaigns
    );
    Ok(())
}
