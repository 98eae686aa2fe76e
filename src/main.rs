use anyhow::{anyhow, Context, Result};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use clap::{Parser, Subcommand, ValueEnum};
use ponos_config::PonosConfig;
use ponos_mcp::{passthrough, ToolClient};
use ponos_upgrade::{parse_image_spec, UpgradeOutcome, UpgradeRequest, UpgradeWorkflow};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const MAX_BODY_BYTES: usize = 1 << 20;

#[derive(Parser)]
#[command(name = "ponos")]
#[command(about = "Node upgrade bot driving a remote repository tool server", long_about = None)]
struct Cli {
    /// Defaults to $PONOS_CONFIG, then ponos.yaml
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration and open a session with the tool server
    Check,

    /// Invoke one tool and print its raw result
    Call {
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
    },

    /// Print a file from a repository
    ReadFile {
        owner: String,
        repo: String,
        path: String,

        /// Branch, tag or commit
        #[arg(long = "ref")]
        git_ref: Option<String>,
    },

    /// Rewrite a project's image tags and open a pull request
    Upgrade {
        /// Project name or network
        #[arg(short, long)]
        project: String,

        /// <repository>=<tag>, repeatable
        #[arg(short, long = "image", required = true)]
        images: Vec<String>,

        #[arg(long)]
        branch_prefix: Option<String>,

        #[arg(long)]
        title: Option<String>,
    },

    /// Serve the JSON-RPC pass-through at POST /mcp/github
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose, cli.log_format) {
        eprintln!("failed to initialize logging: {:#}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(cli).await {
        eprintln!("operation failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let path = cli.config.unwrap_or_else(PonosConfig::default_config_path);
    let config = PonosConfig::load(&path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;

    match cli.command {
        Commands::Check => check(&config).await,
        Commands::Call { tool, args } => call(&config, &tool, &args).await,
        Commands::ReadFile {
            owner,
            repo,
            path,
            git_ref,
        } => read_file(&config, &owner, &repo, &path, git_ref.as_deref()).await,
        Commands::Upgrade {
            project,
            images,
            branch_prefix,
            title,
        } => upgrade(&config, &project, &images, branch_prefix, title).await,
        Commands::Serve { port } => serve(&config, port).await,
    }
}

async fn check(config: &PonosConfig) -> Result<()> {
    let client = ToolClient::from_config(config)?;
    println!("Configuration OK ({} project(s))", config.projects.len());
    println!("Auth mode: {}", client.credentials().mode_name());

    let session = client.connect().await?;
    println!("Tool server: {}", config.github.mcp_url);
    println!("Session: {}", session.session_id().unwrap_or("(none)"));
    println!("Protocol: {}", session.protocol_version);
    if let Some(server) = &session.server {
        println!("Server: {} {}", server.name, server.version);
    }

    client.close();
    Ok(())
}

async fn call(config: &PonosConfig, tool: &str, args: &str) -> Result<()> {
    let arguments: Value = serde_json::from_str(args).context("--args must be a JSON object")?;
    if !arguments.is_object() {
        return Err(anyhow!("--args must be a JSON object"));
    }

    let client = ToolClient::from_config(config)?;
    let result = client.call_tool(tool, arguments).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    client.close();
    Ok(())
}

async fn read_file(
    config: &PonosConfig,
    owner: &str,
    repo: &str,
    path: &str,
    git_ref: Option<&str>,
) -> Result<()> {
    let client = ToolClient::from_config(config)?;
    let content = client.get_file_contents(owner, repo, path, git_ref).await?;
    print!("{}", content);

    client.close();
    Ok(())
}

async fn upgrade(
    config: &PonosConfig,
    project_name: &str,
    image_specs: &[String],
    branch_prefix: Option<String>,
    title: Option<String>,
) -> Result<()> {
    let project = config
        .find_project(project_name)
        .ok_or_else(|| anyhow!("unknown project '{}'", project_name))?;

    let mut images = HashMap::new();
    for spec in image_specs {
        let (repo, tag) = parse_image_spec(spec)?;
        images.insert(repo, tag);
    }
    let mut request = UpgradeRequest::new(images);
    if let Some(prefix) = branch_prefix {
        request = request.with_branch_prefix(prefix);
    }
    if let Some(title) = title {
        request = request.with_title(title);
    }

    let client = Arc::new(ToolClient::from_config(config)?);
    let workflow = UpgradeWorkflow::new(client.clone(), config.github.bot_name.clone());

    match workflow.run(project, &request).await? {
        UpgradeOutcome::NoChanges => println!("No changes: images already at the requested tags"),
        UpgradeOutcome::PullRequest(summary) => {
            println!("Pull request: {}", summary.pr_url);
            println!("Branch: {}", summary.branch);
            println!("Commit: {}", summary.commit_sha);
            for upgrade in &summary.upgrades {
                println!("  {}: {} -> {}", upgrade.file, upgrade.old_image, upgrade.new_image);
            }
        }
    }

    client.close();
    Ok(())
}

#[derive(Clone)]
struct AppState {
    client: Option<Arc<ToolClient>>,
}

async fn serve(config: &PonosConfig, port: Option<u16>) -> Result<()> {
    let client = match ToolClient::from_config(config) {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            warn!("Tool client unavailable, pass-through will answer 503: {}", e);
            None
        }
    };

    let app = router(AppState {
        client: client.clone(),
    });

    let port = port.unwrap_or(config.server.port);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {}", port))?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(client) = client {
        client.close();
    }
    info!("Server stopped");
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/mcp/github", post(github_passthrough))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors_layer())
        .with_state(state)
}

async fn github_passthrough(State(state): State<AppState>, body: Bytes) -> Response {
    let (status, response) = passthrough::handle(state.client.as_deref(), &body).await;
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response)).into_response()
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

fn init_logging(verbose: bool, format: LogFormat) -> Result<()> {
    let filter = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    // stdout carries command output.
    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()?,
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?,
    }

    Ok(())
}
