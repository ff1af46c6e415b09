pub mod handlers;

use std::path::PathBuf;

use clap::{value_parser, Arg, ArgAction, Command};

pub fn build_cli() -> Command {
    Command::new("consul-op")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Consul KV, distributed locks and service registration")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .global(true)
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("YAML config file (default: consul-op.yml)"),
        )
        .arg(
            Arg::new("agent")
                .short('a')
                .long("agent")
                .global(true)
                .value_name("ADDR")
                .help("Agent address, host:port or consul://host:port/path?check_interval=.."),
        )
        .subcommand(cmd_kv())
        .subcommand(cmd_lock())
        .subcommand(service_args(
            Command::new("register").about("Register this service with the agent"),
        ))
        .subcommand(service_args(
            Command::new("deregister").about("Remove this service from the agent"),
        ))
        .subcommand(Command::new("services").about("List all services in the catalog"))
        .subcommand(
            Command::new("service")
                .about("List the instances of one service")
                .arg(Arg::new("name").required(true)),
        )
        .subcommand(service_args(Command::new("serve").about(
            "Register, stay registered until SIGINT/SIGTERM, then deregister",
        )))
}

fn cmd_kv() -> Command {
    let key = || Arg::new("key").required(true);
    Command::new("kv")
        .about("Key-value store")
        .subcommand_required(true)
        .subcommand(Command::new("get").about("Print a value").arg(key()))
        .subcommand(
            Command::new("get-version")
                .about("Print a value with its modify index, as JSON")
                .arg(key()),
        )
        .subcommand(
            Command::new("put")
                .about("Store a value")
                .arg(key())
                .arg(Arg::new("value").required(true)),
        )
        .subcommand(Command::new("delete").about("Delete a key").arg(key()))
}

fn cmd_lock() -> Command {
    Command::new("lock")
        .about("Acquire a lock and hold it until SIGINT/SIGTERM")
        .arg(Arg::new("name").required(true))
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("SECS")
                .value_parser(value_parser!(u64))
                .help("Give up if the lock is not granted in time"),
        )
}

/// Overrides for the service descriptor.
fn service_args(command: Command) -> Command {
    command
        .arg(Arg::new("name").long("name").help("Service name (ID and Name)"))
        .arg(Arg::new("ip").long("ip").help("Address other services reach this one on"))
        .arg(
            Arg::new("port")
                .long("port")
                .value_parser(value_parser!(u16))
                .help("Service port"),
        )
        .arg(Arg::new("path").long("path").help("Health endpoint path"))
        .arg(
            Arg::new("interval")
                .long("interval")
                .help("Health-check interval, e.g. 10s"),
        )
        .arg(
            Arg::new("print")
                .long("print")
                .action(ArgAction::SetTrue)
                .help("Print the descriptor before submitting it"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        build_cli().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() -> Result<(), clap::Error> {
        let matches =
            build_cli().try_get_matches_from(["consul-op", "kv", "get", "a/b", "--agent", "x:1"])?;
        assert_eq!(
            matches.get_one::<String>("agent").map(String::as_str),
            Some("x:1")
        );
        Ok(())
    }

    #[test]
    fn test_lock_timeout_must_be_a_number() {
        let result = build_cli().try_get_matches_from(["consul-op", "lock", "job", "--timeout", "soon"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_subcommand_required() {
        assert!(build_cli().try_get_matches_from(["consul-op"]).is_err());
    }
}
