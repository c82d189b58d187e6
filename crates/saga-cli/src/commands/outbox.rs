//! `saga outbox` - inspect and repair the projection-apply outbox.
//!
//! # Commands
//!
//! - `saga outbox summary` - per-status counts and the oldest pending row
//! - `saga outbox list [--status S] [--limit N]` - rows in due order
//! - `saga outbox requeue <campaign> <seq>` - revive one dead row
//! - `saga outbox requeue-dead --limit N` - revive the oldest dead rows
//! - `saga outbox shadow [--once]` - run the shadow worker until Ctrl-C

use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Subcommand;
use saga_core::config::SagaConfig;
use saga_core::context::CallContext;
use saga_core::{Store, StoreError};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Access, open_store, print_json};

/// Outbox subcommands.
#[derive(Debug, Subcommand)]
pub enum OutboxCommand {
    /// Print per-status counts and the oldest pending row
    Summary,

    /// List rows ordered by next attempt
    List {
        /// Only rows with this status (pending, processing, failed, dead)
        #[arg(long, default_value = "")]
        status: String,

        /// Maximum rows to print
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Move one dead row back to pending
    Requeue {
        /// Campaign of the row
        campaign_id: String,

        /// Sequence of the row
        seq: u64,
    },

    /// Move the oldest dead rows back to pending
    RequeueDead {
        /// Maximum rows to requeue
        #[arg(long)]
        limit: usize,
    },

    /// Run the shadow worker: claim due rows and record them as failed
    /// without applying
    Shadow {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },
}

#[derive(Debug, Serialize)]
struct RequeueOutcome<'a> {
    campaign_id: &'a str,
    seq: u64,
    requeued: bool,
}

pub fn run(config: &SagaConfig, command: OutboxCommand) -> Result<()> {
    let store = open_store(config, Access::Read)?;
    let ctx = CallContext::background();

    match command {
        OutboxCommand::Summary => {
            let summary = store
                .get_projection_apply_outbox_summary(&ctx)
                .context("failed to summarize outbox")?;
            print_json(&summary)
        },
        OutboxCommand::List { status, limit } => {
            let rows = store
                .list_projection_apply_outbox_rows(&ctx, &status, limit)
                .context("failed to list outbox rows")?;
            print_json(&rows)
        },
        OutboxCommand::Requeue { campaign_id, seq } => {
            let requeued = store
                .requeue_projection_apply_outbox_row(&ctx, &campaign_id, seq, Utc::now())
                .context("failed to requeue outbox row")?;
            print_json(&RequeueOutcome {
                campaign_id: &campaign_id,
                seq,
                requeued,
            })?;
            if !requeued {
                bail!("row {campaign_id}/{seq} is not dead-lettered");
            }
            Ok(())
        },
        OutboxCommand::RequeueDead { limit } => {
            let count = store
                .requeue_projection_apply_outbox_dead_rows(&ctx, limit, Utc::now())
                .context("failed to requeue dead outbox rows")?;
            println!("requeued {count} dead rows");
            Ok(())
        },
        OutboxCommand::Shadow { once } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to build tokio runtime")?;
            let attempted = runtime.block_on(run_shadow(
                store,
                config.outbox.batch_limit,
                config.outbox.poll_interval,
                once,
            ))?;
            println!("shadow worker attempted {attempted} rows");
            Ok(())
        },
    }
}

/// Runs shadow passes every `poll_interval` until Ctrl-C (or once).
///
/// Store calls are blocking and run on the blocking pool; Ctrl-C trips the
/// token that every pass's [`CallContext`] observes.
async fn run_shadow(
    store: Store,
    batch_limit: usize,
    poll_interval: Duration,
    once: bool,
) -> Result<usize> {
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl-C, stopping shadow worker");
            signal_token.cancel();
        }
    });

    shadow_loop(store, token, batch_limit, poll_interval, once).await
}

async fn shadow_loop(
    store: Store,
    token: CancellationToken,
    batch_limit: usize,
    poll_interval: Duration,
    once: bool,
) -> Result<usize> {
    let mut total = 0;
    loop {
        let ctx = CallContext::with_token(token.clone());
        let worker = store.clone();
        let pass = tokio::task::spawn_blocking(move || {
            worker.process_projection_apply_outbox_shadow(&ctx, Utc::now(), batch_limit)
        })
        .await
        .context("shadow worker task panicked")?;

        match pass {
            Ok(attempted) => {
                total += attempted;
                if attempted > 0 {
                    info!(attempted, "shadow pass complete");
                }
            },
            Err(StoreError::Canceled) => break,
            Err(err) if err.is_retryable() => {
                warn!(error = %err, "shadow pass hit database contention, retrying");
            },
            Err(err) => return Err(err).context("shadow pass failed"),
        }

        if once {
            break;
        }
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(poll_interval) => {},
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use saga_core::{NewEvent, OutboxStatus};

    use super::*;
    use crate::commands::test_support::temp_config;

    fn seeded(count: u32) -> (SagaConfig, tempfile::TempDir, Store) {
        let (config, dir) = temp_config();
        let store = open_store(&config, Access::Signed).unwrap();
        for n in 0..count {
            store
                .append_event(
                    &CallContext::background(),
                    NewEvent::new("camp", "t", "user", format!(r#"{{"n":{n}}}"#).into_bytes()),
                )
                .unwrap();
        }
        (config, dir, store)
    }

    #[tokio::test]
    async fn shadow_once_marks_due_rows_failed() {
        let (_config, _dir, store) = seeded(3);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let attempted = shadow_loop(
            store.clone(),
            CancellationToken::new(),
            10,
            Duration::from_millis(10),
            true,
        )
        .await
        .unwrap();
        assert_eq!(attempted, 3);

        let failed = store
            .list_projection_apply_outbox_rows(&CallContext::background(), "failed", 10)
            .unwrap();
        assert_eq!(failed.len(), 3);
        assert!(failed.iter().all(|r| r.status == OutboxStatus::Failed));
    }

    #[tokio::test]
    async fn canceled_shadow_loop_stops() {
        let (_config, _dir, store) = seeded(1);
        let token = CancellationToken::new();
        token.cancel();

        let attempted = shadow_loop(store, token, 10, Duration::from_secs(60), false)
            .await
            .unwrap();
        assert_eq!(attempted, 0);
    }

    #[test]
    fn requeue_of_live_row_fails() {
        let (config, _dir, _store) = seeded(1);
        let err = run(
            &config,
            OutboxCommand::Requeue {
                campaign_id: "camp".to_string(),
                seq: 1,
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("not dead-lettered"));

        run(&config, OutboxCommand::Summary).unwrap();
        run(
            &config,
            OutboxCommand::List {
                status: "pending".to_string(),
                limit: 10,
            },
        )
        .unwrap();
        assert!(
            run(
                &config,
                OutboxCommand::List {
                    status: "bogus".to_string(),
                    limit: 10,
                },
            )
            .is_err()
        );
    }
}
