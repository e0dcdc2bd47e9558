use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use custodia::http::{build_router, AppState};
use custodia::{
    handle_request, initialize_root, shutdown_root, JsonRpcRequest, RootConfig, RootError,
    RootState,
};

/// Custodia: consent and claims-resolution engine
///
/// Users keep one ledger of personal data; applications only see what the
/// user consented to share with them.
#[derive(Parser, Debug)]
#[command(name = "custodia", version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the data directory and write the default configuration
    Init {
        /// Data directory for Custodia state
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Start the server
    Serve {
        /// Bind address, overrides server.bind
        #[arg(long)]
        bind: Option<String>,

        /// Port, overrides server.port
        #[arg(long)]
        port: Option<u16>,

        /// Serve JSON-RPC over stdin/stdout instead of HTTP
        #[arg(long)]
        stdio: bool,
    },

    /// List the scopes the catalog offers
    Catalog,

    /// Delete ledger records older than the retention window
    Purge {
        /// Records created more than this many days ago are removed
        #[arg(long)]
        older_than_days: u64,
    },
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("custodia=debug,custodia_ledger=debug,custodia_consent=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("custodia=info"))
    };

    // Logs go to stderr so the stdio transport keeps stdout for responses.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<RootConfig, RootError> {
    match path {
        Some(p) => RootConfig::load(p),
        None => {
            let default_path = RootConfig::default_config_path();
            RootConfig::load(&default_path)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = run(cli).await;
    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), RootError> {
    match cli.command {
        Commands::Init { data_dir } => cmd_init(cli.config.as_ref(), data_dir),
        Commands::Serve { bind, port, stdio } => {
            cmd_serve(cli.config.as_ref(), bind, port, stdio).await
        }
        Commands::Catalog => cmd_catalog(cli.config.as_ref()),
        Commands::Purge { older_than_days } => cmd_purge(cli.config.as_ref(), older_than_days),
    }
}

fn cmd_init(config_path: Option<&PathBuf>, data_dir: Option<PathBuf>) -> Result<(), RootError> {
    let mut config = load_config(config_path)?;
    if let Some(dd) = data_dir {
        config.data_dir = dd;
    }

    info!("initializing custodia");
    let mut state = initialize_root(config.clone())?;

    let save_path = config_path
        .cloned()
        .unwrap_or_else(RootConfig::default_config_path);
    config.save(&save_path)?;

    println!("Custodia initialized successfully.");
    println!("  Data dir: {}", state.config.data_dir.display());
    println!("  Storage:  {:?}", state.config.storage.backend);
    println!("  Config:   {}", save_path.display());

    shutdown_root(&mut state)
}

async fn cmd_serve(
    config_path: Option<&PathBuf>,
    bind: Option<String>,
    port: Option<u16>,
    stdio: bool,
) -> Result<(), RootError> {
    let mut config = load_config(config_path)?;
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let state = initialize_root(config)?;
    if stdio {
        serve_stdio(state).await
    } else {
        serve_http(state).await
    }
}

async fn serve_stdio(mut state: RootState) -> Result<(), RootError> {
    use tokio::io::AsyncBufReadExt;

    info!("serving JSON-RPC on stdio");
    let reader = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<JsonRpcRequest>(line) {
            Ok(request) => serde_json::to_value(handle_request(&state, &request))?,
            Err(e) => serde_json::json!({
                "jsonrpc": "2.0",
                "error": {
                    "code": custodia::rpc_codes::PARSE_ERROR,
                    "message": format!("parse error: {}", e)
                },
                "id": null
            }),
        };
        println!("{}", response);
    }

    shutdown_root(&mut state)
}

async fn serve_http(state: RootState) -> Result<(), RootError> {
    let addr = format!("{}:{}", state.config.server.bind, state.config.server.port);
    let app_state = Arc::new(AppState { root: state });
    let app = build_router(app_state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "serving HTTP");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}

fn cmd_catalog(config_path: Option<&PathBuf>) -> Result<(), RootError> {
    let config = load_config(config_path)?;
    let catalog = config.catalog.build()?;

    println!("Scopes ({}):", catalog.definitions().len());
    for def in catalog.definitions() {
        println!(
            "  {:<16} {:<14} {:<24} {}",
            def.scope_name.as_str(),
            def.attribute_type.as_str(),
            def.display_label,
            def.category.title()
        );
    }
    Ok(())
}

fn cmd_purge(config_path: Option<&PathBuf>, older_than_days: u64) -> Result<(), RootError> {
    let config = load_config(config_path)?;
    let mut state = initialize_root(config)?;

    if let Some(engine) = &state.engine {
        let removed = engine.purge(older_than_days)?;
        println!(
            "Purged {} ledger record(s) older than {} day(s).",
            removed, older_than_days
        );
    }

    shutdown_root(&mut state)
}
