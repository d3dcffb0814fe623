use clap::Parser;
use remcli_daemon::config::Args;
use remcli_daemon::lifecycle;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "remcli_daemon=info".into()),
        )
        .init();

    let args = Args::parse();

    match lifecycle::run(args).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "daemon failed");
            std::process::exit(1);
        }
    }
}
