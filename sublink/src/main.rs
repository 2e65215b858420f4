use anyhow::{Context, Result};
use secrecy::SecretString;
use std::io::{BufRead, Write};
use std::sync::Arc;
use sublink::config::Configuration;
use sublink::core::CoreController;
use sublink::events::{self, AppEvent, EventReceiver};
use sublink::{logging, App};
use sublink_auth::{FileStore, KeyValueStore};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Configuration::new().context("Failed to load configuration")?;
    config.validate().map_err(anyhow::Error::msg)?;

    let log = logging::init_logging()?;
    tracing::info!(log_file = %log.path.display(), "sublink starting");

    let data_dir = config.auth.data_dir()?;
    let kv: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(data_dir.join("session.json"))?);
    let profiles_dir = config
        .core
        .profiles_dir
        .clone()
        .unwrap_or_else(|| data_dir.join("profiles"));
    let core = Arc::new(CoreController::new(&config.core, profiles_dir)?);

    let (event_tx, event_rx) = events::channel();
    let app = App::new(&config, kv, core.clone(), event_tx)?;

    if !app.auth().validate_session().await {
        sign_in(&app).await?;
    }

    let printer = tokio::spawn(print_events(event_rx));

    let (sample_tx, sample_rx) = mpsc::unbounded_channel();
    let feed = tokio::spawn(async move { core.run_feed(sample_tx).await });

    app.run(sample_rx).await?;

    feed.abort();
    printer.abort();
    tracing::info!("sublink stopped");
    Ok(())
}

async fn sign_in(app: &App) -> Result<()> {
    let (email, password) = match (
        std::env::var("SUBLINK_EMAIL"),
        std::env::var("SUBLINK_PASSWORD"),
    ) {
        (Ok(email), Ok(password)) => (email, password),
        _ => prompt_credentials()?,
    };

    match app.login(&email, &SecretString::from(password)).await {
        Ok(user) => {
            println!("Signed in as {}", user.email.as_deref().unwrap_or(&email));
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "Sign in failed");
            anyhow::bail!("{}", e.user_message())
        }
    }
}

fn prompt_credentials() -> Result<(String, String)> {
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();

    print!("Email: ");
    std::io::stdout().flush()?;
    let email = lines.next().context("No email entered")??;

    print!("Password: ");
    std::io::stdout().flush()?;
    let password = lines.next().context("No password entered")??;

    Ok((email.trim().to_string(), password))
}

async fn print_events(mut rx: EventReceiver) {
    while let Some(event) = rx.recv().await {
        match event {
            AppEvent::QuotaWarning { used, limit, percent } => {
                println!("Traffic at {:.0}% of quota ({:.2} / {:.2} MB)", percent, used, limit)
            }
            AppEvent::QuotaExceeded { used, limit } => {
                println!("Traffic quota exceeded ({:.2} / {:.2} MB)", used, limit)
            }
            AppEvent::TrafficReported {
                uploaded_mb,
                downloaded_mb,
            } => tracing::debug!(uploaded_mb, downloaded_mb, "Traffic reported"),
            AppEvent::SessionExpired => println!("Session expired, please sign in again"),
            AppEvent::ProxySynced { message } => println!("{}", message),
            AppEvent::ProxySyncFailed { message } => eprintln!("Proxy sync failed: {}", message),
        }
    }
}
