use std::process;

use consul_op::cli::{build_cli, handlers};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let matches = build_cli().get_matches();

    if let Err(err) = handlers::dispatch(&matches).await {
        #[allow(clippy::print_stderr)]
        {
            eprintln!("Error: {err:#}");
        }

        let code = err
            .downcast_ref::<consul_op_core::Error>()
            .map_or(1, consul_op_core::Error::exit_code);

        #[allow(clippy::exit)]
        process::exit(code);
    }
}
