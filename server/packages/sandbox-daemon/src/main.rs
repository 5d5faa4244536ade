use std::io;
use std::process::ExitCode;

use clap::Parser;
use sandbox_daemon::config::{Cli, Command, ConfigError, ServerArgs};
use sandbox_daemon::logging::init_logging;
use sandbox_daemon::{build_router, ApiDoc, AppState};
use thiserror::Error;
use utoipa::OpenApi;

#[derive(Debug, Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[source] io::Error),
    #[error("failed to render openapi document: {0}")]
    OpenApi(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Server(args) => serve(args).await,
        Command::Openapi => print_openapi(),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "sandbox-daemon exited");
            ExitCode::FAILURE
        }
    }
}

fn print_openapi() -> Result<(), StartupError> {
    println!("{}", ApiDoc::openapi().to_pretty_json()?);
    Ok(())
}

async fn serve(args: ServerArgs) -> Result<(), StartupError> {
    let config = args.into_config()?;
    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!(
        addr = %addr,
        workspace_root = %config.workspace_root.display(),
        auth = config.auth.enabled,
        agent = %config.agent.program,
        "starting sandbox daemon"
    );

    let state = AppState::from_config(config);
    let events = state.events().clone();
    let provider = state.provider();
    let mut shutdown = state.shutdown_signal();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: addr.clone(),
            source,
        })?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("interrupt received"),
                _ = shutdown.wait_for(|requested| *requested) => {}
            }
            if let Err(err) = provider.stop().await {
                tracing::warn!(error = %err, "failed to stop agent provider");
            }
            // Followers hold their responses open until the log closes.
            events.close();
        })
        .await
        .map_err(StartupError::Serve)?;

    tracing::info!("sandbox daemon stopped");
    Ok(())
}
