mod kv;
mod lock;
mod service;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::ArgMatches;
use consul_op_core::{config::load_config, Operator, OperatorConfig};

/// Build the operator from config sources and run the selected command.
pub async fn dispatch(matches: &ArgMatches) -> Result<()> {
    let config = operator_config(matches)?;
    let mut operator = Operator::from_config(config);
    operator.fix_defaults();
    operator
        .connect()
        .await
        .with_context(|| format!("Cannot reach agent {}", operator.config().agent))?;
    run(&operator, matches).await
}

/// Run the selected command against a connected operator.
pub async fn run(operator: &Operator, matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("kv", sub_m)) => kv::handle(operator, sub_m).await,
        Some(("lock", sub_m)) => lock::handle(operator, sub_m).await,
        Some(("register", sub_m)) => service::register(operator, sub_m).await,
        Some(("deregister", _)) => service::deregister(operator).await,
        Some(("services", _)) => service::list_all(operator).await,
        Some(("service", sub_m)) => service::list_one(operator, sub_m).await,
        Some(("serve", sub_m)) => service::serve(operator, sub_m).await,
        _ => anyhow::bail!("Unknown command. Run 'consul-op --help' for usage."),
    }
}

/// Config file and environment, then CLI flags on top.
pub fn operator_config(matches: &ArgMatches) -> Result<OperatorConfig> {
    let path = matches.get_one::<PathBuf>("config");
    let mut config = load_config(path.map(PathBuf::as_path))?;

    if let Some(agent) = matches.get_one::<String>("agent") {
        config.agent.clone_from(agent);
    }
    if let Some(("register" | "deregister" | "serve", sub_m)) = matches.subcommand() {
        apply_service_args(&mut config, sub_m);
    }
    Ok(config)
}

fn apply_service_args(config: &mut OperatorConfig, matches: &ArgMatches) {
    let text = |id: &str| matches.try_get_one::<String>(id).ok().flatten().cloned();

    if let Some(name) = text("name") {
        config.name = name;
    }
    if let Some(ip) = text("ip") {
        config.ip = ip;
    }
    if let Some(path) = text("path") {
        config.path = path;
    }
    if let Some(interval) = text("interval") {
        config.interval = interval;
    }
    if let Some(port) = matches.try_get_one::<u16>("port").ok().flatten() {
        config.port = *port;
    }
}

pub(crate) fn required<'a>(matches: &'a ArgMatches, id: &str) -> Result<&'a str> {
    matches
        .get_one::<String>(id)
        .map(String::as_str)
        .with_context(|| format!("Missing required argument <{id}>"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use consul_op_core::{MemoryBackend, MemoryConnector};

    use super::*;
    use crate::cli::build_cli;

    async fn memory_operator(backend: &MemoryBackend) -> Result<Operator> {
        let mut operator = Operator::with_connector(
            OperatorConfig::new("localhost:8500"),
            Arc::new(MemoryConnector::new(backend.clone())),
        );
        operator.config_mut().ip = "10.0.0.1".into();
        operator.config_mut().name = "svc-a".into();
        operator.fix_defaults();
        operator.connect().await?;
        Ok(operator)
    }

    fn matches(args: &[&str]) -> Result<ArgMatches> {
        Ok(build_cli().try_get_matches_from(
            std::iter::once("consul-op").chain(args.iter().copied()),
        )?)
    }

    #[test]
    fn test_config_file_then_flags() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("svc.yml");
        std::fs::write(&path, "agent: file-agent:8500\nname: from-file\nport: 7000\n")?;
        let path = path.to_string_lossy().into_owned();

        let config = operator_config(&matches(&[
            "--config", path.as_str(), "register", "--port", "9000",
        ])?)?;
        assert_eq!(config.agent, "file-agent:8500");
        assert_eq!(config.name, "from-file");
        assert_eq!(config.port, 9000);

        let config = operator_config(&matches(&[
            "--config", path.as_str(), "--agent", "flag-agent:8500", "services",
        ])?)?;
        assert_eq!(config.agent, "flag-agent:8500");
        assert_eq!(config.port, 7000);
        Ok(())
    }

    #[tokio::test]
    async fn test_kv_commands_round_trip() -> Result<()> {
        let backend = MemoryBackend::new();
        let operator = memory_operator(&backend).await?;

        run(&operator, &matches(&["kv", "put", "app/config", "v1"])?).await?;
        assert_eq!(operator.get("app/config").await?, b"v1");

        run(&operator, &matches(&["kv", "delete", "app/config"])?).await?;
        let missing = run(&operator, &matches(&["kv", "get", "app/config"])?).await;
        let code = missing
            .err()
            .and_then(|e| e.downcast_ref::<consul_op_core::Error>().map(consul_op_core::Error::exit_code));
        assert_eq!(code, Some(3));
        Ok(())
    }

    #[tokio::test]
    async fn test_register_and_deregister_commands() -> Result<()> {
        let backend = MemoryBackend::new();
        let operator = memory_operator(&backend).await?;

        run(&operator, &matches(&["register"])?).await?;
        assert_eq!(operator.list_service("svc-a").await?.len(), 1);

        run(&operator, &matches(&["deregister"])?).await?;
        assert!(operator.list_service("svc-a").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_lock_timeout_gives_up() -> Result<()> {
        let backend = MemoryBackend::new();
        let holder = memory_operator(&backend).await?;
        let operator = memory_operator(&backend).await?;
        let cancel = tokio_util::sync::CancellationToken::new();
        assert!(holder.acquire("job", &cancel).await?.is_held());

        let result = run(&operator, &matches(&["lock", "job", "--timeout", "0"])?).await;
        assert!(result.is_err());
        assert!(!operator.is_held("job"));
        Ok(())
    }
}
