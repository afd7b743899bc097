//! larkauth - Lark / Feishu user login from the terminal
//!
//! Signs in through the browser, caches user access tokens and keeps them fresh
//! for scripted API calls.

mod api;
mod auth;
mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Method;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use auth::{AccessState, AuthError, AuthFlow, LoginOutcome};
use config::Config;

#[derive(Parser)]
#[command(name = "larkauth")]
#[command(about = "Sign in to the Lark / Feishu Open Platform and call its APIs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in through the browser
    Login {
        /// Ignore any cached token and authorize again
        #[arg(short, long)]
        force: bool,
    },

    /// Remove cached tokens
    Logout {
        /// Remove tokens of every application, not just the configured one
        #[arg(long)]
        all: bool,
    },

    /// Show cached token state (offline)
    Status,

    /// Show the signed-in user
    Whoami,

    /// Print an Authorization header for scripts
    Token,

    /// Call an Open Platform API with the cached user token
    Api {
        /// HTTP method, e.g. GET or POST
        method: String,

        /// Path below the domain, e.g. /open-apis/wiki/v2/spaces
        path: String,

        /// JSON request body
        #[arg(short, long)]
        data: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            if let Some(auth) = e.downcast_ref::<AuthError>() {
                tracing::debug!(shape = ?auth.shape(), "Request failed");
                if let Some(hint) = auth.hint() {
                    eprintln!("Hint: {}", hint);
                }
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    let config = Config::load()?;
    let mut flow = AuthFlow::from_config(config)?;

    match command {
        Commands::Login { force } => {
            tracing::info!("Starting authentication flow...");
            match flow.login(force).await? {
                LoginOutcome::AlreadyAuthenticated(_) => {
                    println!("Already logged in. Use --force to sign in again.")
                }
                LoginOutcome::Refreshed(_) => println!("Token refreshed successfully."),
                LoginOutcome::Authorized(_) => println!("Login successful."),
            }
        }
        Commands::Logout { all } => {
            tracing::info!("Logging out...");
            let removed = flow.logout(all)?;
            if removed == 0 {
                println!("No cached tokens.");
            } else {
                println!("Logged out.");
            }
        }
        Commands::Status => print_status(&flow),
        Commands::Whoami => {
            flow.authenticate().await?;
            let client = flow.api_client()?;
            let me = api::whoami(&client).await?;
            println!();
            println!("Name:     {}", me.name.as_deref().unwrap_or("(none)"));
            println!("Email:    {}", me.email.as_deref().unwrap_or("(none)"));
            println!("Open ID:  {}", me.open_id.as_deref().unwrap_or("(none)"));
            println!("Tenant:   {}", me.tenant_key.as_deref().unwrap_or("(none)"));
        }
        Commands::Token => {
            let headers = flow.auth_headers().await?;
            for (name, value) in headers.iter() {
                println!("{}: {}", name, value.to_str().unwrap_or_default());
            }
        }
        Commands::Api { method, path, data } => {
            let method = Method::from_bytes(method.to_uppercase().as_bytes())
                .with_context(|| format!("Invalid HTTP method: {}", method))?;
            let body = data
                .map(|d| serde_json::from_str::<serde_json::Value>(&d))
                .transpose()
                .context("--data is not valid JSON")?;
            let client = flow.api_client()?;
            let resp = client.request(method, &path, body.as_ref()).await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
    }

    Ok(())
}

fn print_status(flow: &AuthFlow) {
    let status = flow.status();
    let Some(owner) = status.owner else {
        println!("Application: not configured");
        println!("\nRun 'larkauth login' to set up credentials.");
        return;
    };

    println!("Application: {}", owner);
    println!("Token file:  {}", status.token_file.display());
    let format_time = |secs: i64| {
        chrono::DateTime::from_timestamp(secs, 0)
            .map(|t| t.with_timezone(&chrono::Local).to_rfc3339())
            .unwrap_or_else(|| secs.to_string())
    };
    match status.access {
        AccessState::Valid => println!("Access tok:  valid"),
        AccessState::Expired => println!("Access tok:  expired"),
        AccessState::Missing => println!("Access tok:  none"),
    }
    if let Some(exp) = status.expires_at {
        println!("  expires_at: {}", format_time(exp));
    }
    if status.has_refresh_token {
        println!("Refresh tok: present");
        if let Some(exp) = status.refresh_expires_at {
            println!("  expires_at: {}", format_time(exp));
        }
    } else {
        println!("Refresh tok: none");
    }
    if !status.scopes.is_empty() {
        println!("Scopes:      {}", status.scopes.join(" "));
    }

    if status.access == AccessState::Missing {
        println!("\nRun 'larkauth login' to authenticate.");
    }
}
