use anyhow::{Context, Result};
use clap::ArgMatches;
use consul_op_core::{signal_channels, wait_for_signal, Operator};

use super::required;

fn print_descriptor(operator: &Operator, matches: &ArgMatches) -> Result<()> {
    if matches.get_flag("print") {
        let descriptor = operator.service_registration();
        println!("{}", serde_json::to_string_pretty(&descriptor)?);
    }
    Ok(())
}

pub async fn register(operator: &Operator, matches: &ArgMatches) -> Result<()> {
    print_descriptor(operator, matches)?;
    operator.register_service().await?;
    println!("Registered service '{}'", operator.config().name);
    Ok(())
}

pub async fn deregister(operator: &Operator) -> Result<()> {
    operator.deregister_service().await?;
    println!("Deregistered service '{}'", operator.config().name);
    Ok(())
}

pub async fn list_all(operator: &Operator) -> Result<()> {
    let services = operator.list_services().await?;
    let mut names: Vec<_> = services.into_iter().collect();
    names.sort_by(|a, b| a.0.cmp(&b.0));

    for (name, tags) in names {
        if tags.is_empty() {
            println!("{name}");
        } else {
            println!("{name} [{}]", tags.join(", "));
        }
    }
    Ok(())
}

pub async fn list_one(operator: &Operator, matches: &ArgMatches) -> Result<()> {
    let name = required(matches, "name")?;
    let instances = operator.list_service(name).await?;
    println!("{}", serde_json::to_string_pretty(&instances)?);
    Ok(())
}

/// Stay registered until SIGINT/SIGTERM.
pub async fn serve(operator: &Operator, matches: &ArgMatches) -> Result<()> {
    let (mut sigint, mut sigterm) = signal_channels()?;
    register(operator, matches).await?;

    println!("Serving; press Ctrl-C to deregister and exit.");
    wait_for_signal(&mut sigint, &mut sigterm).await;

    operator
        .deregister_service()
        .await
        .context("Deregistration on shutdown failed")?;
    println!("Deregistered service '{}'", operator.config().name);
    Ok(())
}
