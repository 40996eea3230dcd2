use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::Password;
use reqwest::Method;

use vault_session::auth::{CoordinatorState, EndReason, SessionEvent, SessionManager};
use vault_session::config::{CliArgs, Command, Config};
use vault_session::error::ApiError;
use vault_session::http_client::ApiRequest;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenvy::dotenv().ok();

    let args = CliArgs::parse();
    let config = Config::from_args(&args)?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(base_url = %config.base_url, "Configuration loaded");

    let manager = SessionManager::from_config(&config)?;

    // Presentation boundary: report how the session changed
    let mut events = manager.subscribe();

    let result = run(args.command, &manager, &config).await;

    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::Ended {
                reason: EndReason::Expired,
            } => eprintln!("Your session has ended. Run `vault-session login` to sign in again."),
            SessionEvent::Renewed { attempt } => {
                tracing::info!(attempt = attempt, "Access credential renewed")
            }
            _ => {}
        }
    }

    result
}

async fn run(command: Command, manager: &SessionManager, config: &Config) -> Result<()> {
    match command {
        Command::Login { username, password } => {
            let password = match password {
                Some(password) => password,
                None => Password::new()
                    .with_prompt(format!("Password for {}", username))
                    .interact()
                    .context("Failed to read password")?,
            };

            match manager.login(&username, &password).await {
                Ok(()) => println!("Logged in as {}", username),
                Err(e) => anyhow::bail!("{}", e.user_message()),
            }
        }

        Command::Logout => {
            manager.logout();
            println!("Logged out");
        }

        Command::Status => {
            let status = manager.status();
            if status.authenticated {
                println!("Session:     authenticated");
            } else {
                println!("Session:     not logged in");
            }
            match status.coordinator {
                CoordinatorState::Idle => println!("Renewal:     idle"),
                CoordinatorState::Renewing { attempt, queued } => {
                    println!("Renewal:     attempt {} ({} queued)", attempt, queued)
                }
            }
            if let Some(at) = status.last_renewed_at {
                println!("Renewed at:  {}", at.to_rfc3339());
            }
            println!("Database:    {}", config.db_file.display());
        }

        Command::Request { method, path, body } => {
            let method = Method::from_bytes(method.to_uppercase().as_bytes())
                .with_context(|| format!("Invalid HTTP method: {}", method))?;

            let mut request = ApiRequest::new(method, path);
            if let Some(body) = body {
                let json: serde_json::Value =
                    serde_json::from_str(&body).context("Request body is not valid JSON")?;
                request = request.with_json(json);
            }

            match manager.client().send(request).await {
                Ok(response) => {
                    println!("{}", response.status());
                    let text = response.text();
                    match serde_json::from_str::<serde_json::Value>(&text) {
                        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
                        Err(_) => println!("{}", text),
                    }
                }
                Err(e) => report_failure(&e)?,
            }
        }
    }

    Ok(())
}

fn report_failure(e: &ApiError) -> Result<()> {
    tracing::debug!(error = ?e, "Request failed");
    if e.is_session_ending() {
        anyhow::bail!("{}", e.user_message());
    }
    anyhow::bail!("{} ({})", e.user_message(), e)
}
