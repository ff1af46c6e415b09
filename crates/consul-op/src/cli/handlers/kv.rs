use std::io::Write;

use anyhow::Result;
use clap::ArgMatches;
use consul_op_core::Operator;

use super::required;

pub async fn handle(operator: &Operator, matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("get", sub_m)) => {
            let value = operator.get(required(sub_m, "key")?).await?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&value)?;
            stdout.write_all(b"\n")?;
        }
        Some(("get-version", sub_m)) => {
            let key = required(sub_m, "key")?;
            let (value, version) = operator.get_with_version(key).await?;
            let output = serde_json::json!({
                "key": key,
                "value": String::from_utf8_lossy(&value),
                "version": version,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Some(("put", sub_m)) => {
            let key = required(sub_m, "key")?;
            operator
                .put(key, required(sub_m, "value")?.as_bytes())
                .await?;
            println!("Stored '{key}'");
        }
        Some(("delete", sub_m)) => {
            let key = required(sub_m, "key")?;
            operator.delete(key).await?;
            println!("Deleted '{key}'");
        }
        _ => anyhow::bail!("Unknown kv subcommand. Run 'consul-op kv --help' for usage."),
    }
    Ok(())
}
