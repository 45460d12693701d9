use projsyncd::daemon::{DaemonConfig, DaemonMode, launch};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Flush,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--flush" => mode = CliMode::Flush,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            println!("Usage: projsyncd [--flush]");
            println!("  --flush   Upload the working directory once and exit");
            return Ok(());
        }
        CliMode::Flush => DaemonMode::Flush,
        CliMode::Run => DaemonMode::Watch,
    };
    init_tracing();
    let config = DaemonConfig::from_env()?;
    launch(config, mode).await
}
