use crate::auth::AuthService;
use crate::http::{ApiClient, ApiError, TransportError};
use crate::navigation::RecordingNavigator;
use crate::push::{ClientHost, NotificationSurface, PushError, PushHandler};
use crate::session::{KeyringSessionStore, Session};
use crate::settings::{ClientConfig, SettingsError};
use crate::types::{NotificationClick, NotificationSpec, PushMessage, WindowClient};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "flearn", version, about = "Flearn API client")]
pub struct Cli {
  /// JSON settings file; defaults are used for missing keys and `FLEARN_*`
  /// environment variables win over both.
  #[arg(long, global = true)]
  settings: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Sign in and store the session credentials.
  Login {
    #[arg(long)]
    email: String,
    #[arg(long)]
    password: String,
  },
  /// Revoke the refresh token and clear the stored session.
  Logout,
  /// Authenticated GET against the API, printing the JSON body.
  Get { path: String },
  /// Show the profile of the signed-in user.
  Whoami,
  /// Print the stored roles.
  Roles,
  /// Run the push handler against a raw push payload.
  Push { payload: String },
  /// Route a notification click.
  Click {
    #[arg(long)]
    url: Option<String>,
    #[arg(long)]
    action: Option<String>,
  },
}

#[derive(Debug, Error)]
enum AppError {
  #[error(transparent)]
  Settings(#[from] SettingsError),
  #[error(transparent)]
  Transport(#[from] TransportError),
  #[error(transparent)]
  Api(#[from] ApiError),
  #[error(transparent)]
  Push(#[from] PushError),
  #[error("failed to start runtime: {0}")]
  Runtime(#[from] std::io::Error),
  #[error("failed to render output: {0}")]
  Output(#[from] serde_json::Error),
}

/// Host used outside a browser: no windows are ever open or focused.
struct HeadlessHost;

#[async_trait]
impl ClientHost for HeadlessHost {
  async fn match_all(&self) -> Vec<WindowClient> {
    vec![]
  }

  async fn focus(&self, client_id: &str) -> Result<(), PushError> {
    Err(PushError::Window(format!("no window {client_id}")))
  }

  async fn navigate(&self, client_id: &str, _url: &str) -> Result<(), PushError> {
    Err(PushError::Window(format!("no window {client_id}")))
  }

  fn can_open_windows(&self) -> bool {
    false
  }

  async fn open_window(&self, _url: &str) -> Result<(), PushError> {
    Ok(())
  }
}

/// Prints notifications to stdout.
struct StdoutSurface;

#[async_trait]
impl NotificationSurface for StdoutSurface {
  async fn show(&self, spec: &NotificationSpec) -> Result<(), PushError> {
    let rendered =
      serde_json::to_string_pretty(spec).map_err(|e| PushError::Notification(e.to_string()))?;
    println!("{rendered}");
    Ok(())
  }

  async fn close(&self, tag: &str) {
    info!(tag, "notification closed");
  }
}

fn build_session(config: &ClientConfig) -> Session {
  if config.use_keyring {
    let store = KeyringSessionStore::new(config.keyring_service.clone());
    if store.is_available() {
      return Session::new(Arc::new(store));
    }
    warn!("OS keychain is unavailable, session will not outlive this process");
  }
  Session::in_memory()
}

fn print_json(value: &Value) -> Result<(), AppError> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

async fn execute(cli: Cli) -> Result<(), AppError> {
  let config = ClientConfig::load(cli.settings.as_deref())?;
  let session = build_session(&config);
  let navigator = Arc::new(RecordingNavigator::new());
  let client = Arc::new(ApiClient::from_config(&config, session, navigator.clone())?);
  let auth = AuthService::new(client.clone(), &config);

  let result = match cli.command {
    Command::Login { email, password } => {
      let credentials = auth.login(&email, &password).await?;
      println!("signed in as {}", credentials.roles.join(", "));
      Ok(())
    }
    Command::Logout => {
      auth.logout().await?;
      println!("signed out");
      Ok(())
    }
    Command::Get { path } => {
      let body: Value = client.get_json(&path).await?;
      print_json(&body)
    }
    Command::Whoami => {
      let body: Value = client.get_json("/users/me").await?;
      print_json(&body)
    }
    Command::Roles => {
      for role in auth.current_roles() {
        println!("{role}");
      }
      Ok(())
    }
    Command::Push { payload } => {
      let handler = PushHandler::new(HeadlessHost, StdoutSurface, &config.app_origin)?;
      if handler.on_push(&PushMessage::from_json(&payload)).await?.is_none() {
        println!("suppressed");
      }
      Ok(())
    }
    Command::Click { url, action } => {
      let handler = PushHandler::new(HeadlessHost, StdoutSurface, &config.app_origin)?;
      let click = NotificationClick {
        tag: String::new(),
        action,
        url,
      };
      let route = handler.on_notification_click(&click).await?;
      println!("{route:?}");
      Ok(())
    }
  };

  if let Some(location) = navigator.history().last() {
    println!("redirect: {location}");
  }
  result
}

pub fn run() -> ExitCode {
  fmt().with_env_filter(EnvFilter::from_default_env()).init();

  let cli = Cli::parse();
  let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
    Ok(runtime) => runtime,
    Err(e) => {
      eprintln!("error: {}", AppError::Runtime(e));
      return ExitCode::FAILURE;
    }
  };

  match runtime.block_on(execute(cli)) {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      eprintln!("error: {e}");
      ExitCode::FAILURE
    }
  }
}
