//! Routa ACP broker CLI.
//!
//! Serves the broker over HTTP and offers quick introspection of the
//! provider catalog and runtimes without starting a server.

use clap::{Parser, Subcommand};

use routa_acp::{AgentPaths, PresetCatalog, RuntimeKind, RuntimeManager};

#[derive(Parser)]
#[command(
    name = "routa-acp",
    version,
    about = "Routa ACP broker — multi-provider agent session server"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the broker HTTP server
    Serve {
        /// Host to bind to
        #[arg(long, env = "ROUTA_ACP_HOST", default_value = "127.0.0.1")]
        host: String,
        /// Port to listen on
        #[arg(long, env = "ROUTA_ACP_PORT", default_value_t = 3211)]
        port: u16,
    },

    /// List available provider presets
    Presets {
        /// Include agents from the remote registry
        #[arg(long)]
        registry: bool,
    },

    /// Show runtime availability (node, npx, uv, uvx)
    Runtimes,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { host, port } => {
            let (addr, state) =
                match routa_acp_server::start_server(routa_acp_server::ServerConfig {
                    host,
                    port,
                })
                .await
                {
                    Ok(started) => started,
                    Err(e) => {
                        eprintln!("Failed to start server: {e}");
                        std::process::exit(1);
                    }
                };
            println!("routa-acp broker listening on http://{addr}");

            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("signal handler error: {}", e);
            }
            tracing::info!("shutting down — killing live sessions");
            state.shutdown().await;
        }

        Commands::Presets { registry } => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| "warn".into()),
                )
                .init();
            let paths = AgentPaths::new();
            let runtime = std::sync::Arc::new(RuntimeManager::new(paths.clone()));
            let catalog = PresetCatalog::new(runtime, paths);
            let presets = catalog.list_presets(registry).await;
            println!("{}", serde_json::to_string_pretty(&presets).unwrap_or_default());
        }

        Commands::Runtimes => {
            let paths = AgentPaths::new();
            let manager = RuntimeManager::new(paths);
            for kind in [
                RuntimeKind::Node,
                RuntimeKind::Npx,
                RuntimeKind::Uv,
                RuntimeKind::Uvx,
            ] {
                let status = if let Some(info) = manager.managed_runtime(kind).await {
                    format!("managed ({})", info.path.display())
                } else if let Some(info) = manager.system_runtime(kind) {
                    format!("system ({})", info.path.display())
                } else {
                    "not installed".to_string()
                };
                println!("{:<6} {}", kind.command_name(), status);
            }
        }
    }
}
