use std::sync::Arc;

use meshforge::config::Config;
use meshforge::orchestrator::Orchestrator;
use meshforge::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // .env next to the binary first, then dotenvy's CWD search.
    let beside_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(".env")))
        .filter(|path| path.exists());
    match beside_exe {
        Some(path) => {
            dotenvy::from_path(&path).ok();
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    tracing::info!("meshforge starting");

    let config = Config::load()?;
    let orchestrator = Arc::new(Orchestrator::from_config(&config)?);
    tracing::info!(
        providers = orchestrator.registry().adapters().len(),
        image_synthesis = orchestrator.images().can_synthesize(),
        "pipeline ready"
    );

    server::serve(orchestrator, &config.server.bind)
        .await
        .inspect_err(|e| tracing::error!("serving error: {e:?}"))?;

    tracing::info!("meshforge shutting down");
    Ok(())
}
