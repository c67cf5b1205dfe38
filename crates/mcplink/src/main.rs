//! mcplink - command line client for MCP servers.
//!
//! This is the main entry point for the mcplink CLI.

use anyhow::Context;
use clap::{Parser, Subcommand};
use mcplink_auth::{FileStore, OAuthConfig, OAuthProvider, StoredTokens};
use mcplink_client::{
    ConnectionState, McpClient, McpConfig, McpSession, ServerConfig, SessionEvent, ToolContent,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// How long commands wait for a session that parked in an authorization
/// flow before giving up.
const READY_WAIT_SECS: u64 = 300;

#[derive(Parser)]
#[command(name = "mcplink")]
#[command(author, version, about = "Command line client for MCP servers", long_about = None)]
struct Cli {
    /// Config file path (default: ~/.config/mcplink/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the tools a server exposes
    Tools {
        /// Server name from the config file
        #[arg(short, long)]
        server: String,
    },
    /// Call a tool and print its output
    Call {
        /// Server name from the config file
        #[arg(short, long)]
        server: String,
        /// Tool name as the server reports it
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(short, long)]
        args: Option<String>,
    },
    /// List the resources a server exposes
    Resources {
        /// Server name from the config file
        #[arg(short, long)]
        server: String,
    },
    /// List the prompts a server exposes
    Prompts {
        /// Server name from the config file
        #[arg(short, long)]
        server: String,
    },
    /// Run the OAuth authorization flow for a server
    Login {
        /// Server name from the config file
        #[arg(short, long)]
        server: String,
    },
    /// Delete stored credentials for a server
    Logout {
        /// Server name from the config file
        #[arg(short, long)]
        server: String,
    },
    /// Show stored credentials for configured servers
    Status {
        /// Limit to one server
        #[arg(short, long)]
        server: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let config = load_config(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Tools { server } => handle_tools(config, &server).await,
        Commands::Call { server, tool, args } => {
            handle_call(config, &server, &tool, args.as_deref()).await
        }
        Commands::Resources { server } => handle_resources(config, &server).await,
        Commands::Prompts { server } => handle_prompts(config, &server).await,
        Commands::Login { server } => handle_login(config, &server).await,
        Commands::Logout { server } => handle_logout(config, &server).await,
        Commands::Status { server } => handle_status(config, server.as_deref()).await,
    }
}

/// Initialize logging to stderr so command output on stdout stays clean.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        "mcplink=debug,mcplink_client=debug,mcplink_auth=debug,mcplink_tools=debug"
    } else {
        "mcplink=info,mcplink_client=warn,mcplink_auth=warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Load the config file, from `--config` or the default location.
async fn load_config(path: Option<&Path>) -> anyhow::Result<McpConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => McpConfig::default_path()
            .context("Cannot determine the config directory; pass --config")?,
    };

    let config = McpConfig::load(&path).await?;
    tracing::debug!(path = %path.display(), servers = config.servers.len(), "Config loaded");
    Ok(config)
}

/// Look up a server by name, listing the configured names when it is missing.
fn server_config<'a>(config: &'a McpConfig, name: &str) -> anyhow::Result<&'a ServerConfig> {
    match config.server(name) {
        Ok(server) => Ok(server),
        Err(e) => {
            let mut names: Vec<&String> = config.servers.keys().collect();
            names.sort();
            if names.is_empty() {
                eprintln!("No servers configured.");
            } else {
                eprintln!("Configured servers:");
                for name in names {
                    eprintln!("  - {name}");
                }
            }
            Err(e.into())
        }
    }
}

/// Connect and wait until the session is usable.
///
/// A session that parks in an authorization flow is waited on: the URL is
/// surfaced on stderr and the command proceeds once the flow finishes.
async fn ready_session(client: &McpClient, name: &str) -> anyhow::Result<Arc<McpSession>> {
    let session = client
        .create_session(name)
        .await
        .with_context(|| format!("Cannot connect to '{name}'"))?;

    let mut events = session.subscribe();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(READY_WAIT_SECS);
    let mut printed_url: Option<String> = None;

    loop {
        match session.state().await {
            ConnectionState::Ready => return Ok(session),
            ConnectionState::Failed => {
                let reason = session
                    .error()
                    .await
                    .unwrap_or_else(|| "unknown error".to_string());
                anyhow::bail!("Connection to '{name}' failed: {reason}");
            }
            _ => {}
        }

        // The URL may have been surfaced before we subscribed.
        if let Some(url) = session.auth_url().await {
            if printed_url.as_deref() != Some(url.as_str()) {
                print_auth_url(&url);
                printed_url = Some(url);
            }
        }

        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(SessionEvent::AuthUrl(url))) => {
                if printed_url.as_deref() != Some(url.as_str()) {
                    print_auth_url(&url);
                    printed_url = Some(url);
                }
            }
            Ok(Ok(SessionEvent::AuthCompleted {
                success: false,
                error,
            })) => {
                anyhow::bail!(
                    "Authorization for '{name}' failed: {}",
                    error.unwrap_or_else(|| "denied".to_string())
                );
            }
            Ok(Ok(_)) => {}
            Ok(Err(RecvError::Lagged(_))) => {}
            Ok(Err(RecvError::Closed)) => anyhow::bail!("Session for '{name}' closed"),
            Err(_) => anyhow::bail!("Timed out waiting for '{name}' to become ready"),
        }
    }
}

fn print_auth_url(url: &str) {
    eprintln!();
    eprintln!("Authorization required. Open this URL:");
    eprintln!();
    eprintln!("  {url}");
    eprintln!();
}

/// List the tools a server exposes.
async fn handle_tools(config: McpConfig, name: &str) -> anyhow::Result<()> {
    server_config(&config, name)?;
    let client = McpClient::from_config(config).await;
    let session = ready_session(&client, name).await?;

    let tools = session.tools().await;

    println!();
    if tools.is_empty() {
        println!("No tools on '{name}'.");
    } else {
        println!("Tools on '{name}':");
        println!();
        for tool in &tools {
            println!("  {}", tool.name);
            if let Some(desc) = &tool.description {
                println!("      {}", first_line(desc));
            }
        }
        println!();
        println!("{} tool(s)", tools.len());
    }
    println!();

    client.close_all_sessions().await;
    Ok(())
}

/// Call a tool and print its content to stdout.
async fn handle_call(
    config: McpConfig,
    name: &str,
    tool: &str,
    args: Option<&str>,
) -> anyhow::Result<()> {
    let arguments = match args {
        Some(raw) => {
            Some(serde_json::from_str::<serde_json::Value>(raw).context("--args must be valid JSON")?)
        }
        None => None,
    };

    server_config(&config, name)?;
    let client = McpClient::from_config(config).await;
    let session = ready_session(&client, name).await?;

    let result = session
        .call_tool(tool, arguments)
        .await
        .with_context(|| format!("Tool call '{tool}' on '{name}' failed"))?;

    for item in &result.content {
        match item {
            ToolContent::Text { text } => println!("{text}"),
            ToolContent::Image { data, mime_type } => {
                println!("[image: {} bytes, type: {}]", data.len(), mime_type)
            }
            ToolContent::Resource { resource } => match &resource.text {
                Some(text) => println!("{text}"),
                None => println!("[resource: {}]", resource.uri),
            },
        }
    }

    client.close_all_sessions().await;

    if result.is_error {
        anyhow::bail!("Tool '{tool}' reported an error");
    }
    Ok(())
}

/// List the resources and resource templates a server exposes.
async fn handle_resources(config: McpConfig, name: &str) -> anyhow::Result<()> {
    server_config(&config, name)?;
    let client = McpClient::from_config(config).await;
    let session = ready_session(&client, name).await?;

    let resources = session.list_resources().await?;
    let templates = session.list_resource_templates().await?;

    println!();
    if resources.is_empty() && templates.is_empty() {
        println!("No resources on '{name}'.");
    } else {
        if !resources.is_empty() {
            println!("Resources on '{name}':");
            println!();
            for resource in &resources {
                println!("  {}  ({})", resource.name, resource.uri);
                if let Some(desc) = &resource.description {
                    println!("      {}", first_line(desc));
                }
            }
            println!();
        }
        if !templates.is_empty() {
            println!("Resource templates on '{name}':");
            println!();
            for template in &templates {
                println!("  {}  ({})", template.name, template.uri_template);
            }
            println!();
        }
    }

    client.close_all_sessions().await;
    Ok(())
}

/// List the prompts a server exposes.
async fn handle_prompts(config: McpConfig, name: &str) -> anyhow::Result<()> {
    server_config(&config, name)?;
    let client = McpClient::from_config(config).await;
    let session = ready_session(&client, name).await?;

    let prompts = session.list_prompts().await?;

    println!();
    if prompts.is_empty() {
        println!("No prompts on '{name}'.");
    } else {
        println!("Prompts on '{name}':");
        println!();
        for prompt in &prompts {
            let args: Vec<String> = prompt
                .arguments
                .iter()
                .map(|a| {
                    if a.required {
                        a.name.clone()
                    } else {
                        format!("[{}]", a.name)
                    }
                })
                .collect();
            if args.is_empty() {
                println!("  {}", prompt.name);
            } else {
                println!("  {} ({})", prompt.name, args.join(", "));
            }
            if let Some(desc) = &prompt.description {
                println!("      {}", first_line(desc));
            }
        }
    }
    println!();

    client.close_all_sessions().await;
    Ok(())
}

/// Run the OAuth authorization flow for a server.
async fn handle_login(config: McpConfig, name: &str) -> anyhow::Result<()> {
    let server = server_config(&config, name)?;
    let provider = Arc::new(oauth_provider(name, server)?);

    println!();
    println!("OAuth Login");
    println!("===========");
    println!();
    println!("Server: {name}");
    println!("URL: {}", server.url);
    println!();

    // The authorization URL is stored once the flow starts; print it so the
    // user can finish in a browser the provider could not open itself.
    let seen = provider.last_auth_url().await.unwrap_or(None);
    let printer = {
        let provider = Arc::clone(&provider);
        tokio::spawn(async move {
            for _ in 0..100 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                if let Ok(Some(url)) = provider.last_auth_url().await {
                    if seen.as_deref() != Some(url.as_str()) {
                        println!("Open this URL to authorize:");
                        println!();
                        println!("  {url}");
                        println!();
                        break;
                    }
                }
            }
        })
    };

    let result = provider.authorize().await;
    printer.abort();
    let tokens = result.with_context(|| format!("Authorization for '{name}' failed"))?;

    println!("Authorization successful.");
    match tokens.expires_at {
        Some(ts) => println!("Token expires {}.", format_expiry(ts)),
        None => println!("Token has no expiry."),
    }
    println!();
    Ok(())
}

/// Delete stored credentials for a server.
async fn handle_logout(config: McpConfig, name: &str) -> anyhow::Result<()> {
    let server = server_config(&config, name)?;
    let provider = oauth_provider(name, server)?;

    let removed = provider
        .clear_storage()
        .await
        .with_context(|| format!("Cannot clear credentials for '{name}'"))?;

    if removed == 0 {
        println!("No stored credentials for '{name}'.");
    } else {
        println!("Removed {removed} stored record(s) for '{name}'.");
    }
    Ok(())
}

/// Show stored credentials for configured servers.
async fn handle_status(config: McpConfig, only: Option<&str>) -> anyhow::Result<()> {
    let mut names: Vec<String> = config.servers.keys().cloned().collect();
    names.sort();
    if let Some(only) = only {
        server_config(&config, only)?;
        names.retain(|n| n == only);
    }

    if names.is_empty() {
        println!("No servers configured.");
        return Ok(());
    }

    println!();
    println!("Authentication Status");
    println!("=====================");
    println!();

    for name in &names {
        let server = &config.servers[name];
        let provider = oauth_provider(name, server)?;
        let line = match provider.tokens().await {
            Ok(Some(tokens)) => describe_tokens(&tokens),
            Ok(None) => "not authenticated".to_string(),
            Err(e) => format!("token store error: {e}"),
        };
        println!("  {name}: {line}");
    }
    println!();
    Ok(())
}

/// Build an OAuth provider for a configured server, with the on-disk store.
fn oauth_provider(name: &str, server: &ServerConfig) -> anyhow::Result<OAuthProvider> {
    let auth = server.auth.clone().unwrap_or_default();
    let oauth = OAuthConfig {
        scope: auth.scope,
        client_name: auth.client_name.unwrap_or_else(|| "mcplink".to_string()),
        ..OAuthConfig::default()
    };
    let store = FileStore::new()
        .with_context(|| format!("Cannot open the token store for '{name}'"))?;
    Ok(OAuthProvider::new(&server.url, oauth, Arc::new(store)))
}

/// One-line summary of stored tokens.
fn describe_tokens(tokens: &StoredTokens) -> String {
    match tokens.expires_at {
        None => "authenticated (no expiry)".to_string(),
        Some(ts) => {
            let now = chrono::Utc::now().timestamp();
            if ts as i64 > now {
                format!("authenticated, expires {}", format_expiry(ts))
            } else if tokens.refresh_token.is_some() {
                format!("token expired {} (refresh token stored)", format_expiry(ts))
            } else {
                format!("token expired {}", format_expiry(ts))
            }
        }
    }
}

/// Render a unix timestamp as a UTC date.
fn format_expiry(ts: u64) -> String {
    match chrono::DateTime::<chrono::Utc>::from_timestamp(ts as i64, 0) {
        Some(when) => when.format("%Y-%m-%d %H:%M UTC").to_string(),
        None => format!("at unix time {ts}"),
    }
}

/// First line of a possibly multi-line description.
fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}
