use clap::Parser;
use cmdproxy::config::{self, Cli, Command};
use cmdproxy::error::GatewayResult;
use cmdproxy::http::Gateway;
use cmdproxy::ids::UuidGenerator;
use cmdproxy::session::SessionPool;
use cmdproxy::version;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => run_server(args).await?,
    }
    Ok(())
}

async fn run_server(args: config::ServeArgs) -> GatewayResult<()> {
    let config = config::Config::load(&args)?;
    init_logging(&config.logging);
    tracing::info!(
        version = version::VERSION,
        listen = %config.server.listen,
        command_timeout_ms = config.session.command_timeout_ms,
        idle_timeout_ms = config.session.idle_timeout_ms,
        "Starting cmdproxy"
    );

    let pool = SessionPool::new();
    let reaper = (config.session.reap_interval_ms > 0)
        .then(|| pool.spawn_reaper(Duration::from_millis(config.session.reap_interval_ms)));

    let listen = config.server.listen.clone();
    let gateway = Gateway::new(pool, Arc::new(UuidGenerator), config);
    let result = gateway.serve(&listen).await;

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    result
}

fn init_logging(logging: &config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::new(logging.level.clone());
    if logging.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
