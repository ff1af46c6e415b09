use std::time::Duration;

use anyhow::Result;
use clap::ArgMatches;
use consul_op_core::{cancel_on_signal, LockOutcome, Operator};
use tokio_util::sync::CancellationToken;

use super::required;

/// Acquire the lock, hold it until a signal arrives, then release it.
///
/// `--timeout` bounds only the wait for the grant.
pub async fn handle(operator: &Operator, matches: &ArgMatches) -> Result<()> {
    let name = required(matches, "name")?;
    let stop = CancellationToken::new();
    let watcher = cancel_on_signal(stop.clone())?;

    let acquire = stop.child_token();
    let timer = matches.get_one::<u64>("timeout").map(|secs| {
        let acquire = acquire.clone();
        let secs = *secs;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            acquire.cancel();
        })
    });

    println!("Waiting for lock '{name}'...");
    let outcome = operator.acquire(name, &acquire).await;
    if let Some(timer) = timer {
        timer.abort();
    }

    match outcome {
        Ok(LockOutcome::Held) => {}
        Ok(LockOutcome::Cancelled) => {
            watcher.abort();
            anyhow::bail!("Gave up waiting for lock '{name}'");
        }
        Err(e) => {
            watcher.abort();
            return Err(e.into());
        }
    }

    println!("Holding lock '{name}'. Press Ctrl-C to release.");
    stop.cancelled().await;

    operator.release(name).await?;
    println!("Released lock '{name}'");
    Ok(())
}
