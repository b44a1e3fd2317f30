use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

use shellcache::cache::{CacheStorage, SqliteStorage};
use shellcache::config::Config;
use shellcache::control::ControlMessage;
use shellcache::interceptor::InterceptionLayer;
use shellcache::logging;
use shellcache::net::{resolve_url, HttpClient, Network, Request};

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "Offline caching and request interception for app-shell web applications")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Mirror logs to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the configured release into a new generation
  Install {
    /// Count this process as an open page, so an older active release keeps serving
    #[arg(long)]
    keep_waiting: bool,
  },
  /// Promote the waiting release
  Activate,
  /// Serve one request through the layer
  Fetch {
    url: String,
    #[arg(short, long, default_value = "GET")]
    method: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
    /// Accept header to send
    #[arg(long)]
    accept: Option<String>,
  },
  /// Send a control message, e.g. '{"type":"SKIP_WAITING"}'
  Control { message: String },
  /// List generations
  Status,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(&logging::default_dir(), args.verbose)?;

  let config = Config::load(args.config.as_deref())?;

  let storage: Arc<dyn CacheStorage> = match &config.database {
    Some(path) => Arc::new(SqliteStorage::open_at(path)?),
    None => Arc::new(SqliteStorage::open()?),
  };
  let network: Arc<dyn Network> = Arc::new(HttpClient::new(&config.scope)?);
  let layer = InterceptionLayer::new(config, storage, network)?;

  run(&layer, args.command).await?;

  layer.settle().await;
  Ok(())
}

async fn run(layer: &InterceptionLayer, command: Command) -> Result<()> {
  match command {
    Command::Install { keep_waiting } => {
      if keep_waiting {
        layer.client_opened();
      }
      let report = layer.install(&layer.config().release()).await?;
      println!(
        "{} ({}): {} stored, {} failed",
        report.generation,
        report.state,
        report.stored.len(),
        report.failed.len()
      );
      for url in &report.failed {
        println!("  failed: {}", url);
      }
    }

    Command::Activate => match layer.activate().await? {
      Some(generation) => println!("{} is active", generation),
      None => println!("Nothing waiting"),
    },

    Command::Fetch {
      url,
      method,
      navigate,
      accept,
    } => {
      let url = parse_url(&layer.config().scope, &url)?;
      let mut request = if navigate {
        Request::navigate(url)
      } else {
        Request::new(&method, url)
      };
      if let Some(accept) = accept {
        request = request.with_header("accept", &accept);
      }

      let result = layer.serve_traced(request).await;
      eprintln!("{} (from {})", result.data.status(), result.source);
      println!("{}", result.data.text());
    }

    Command::Control { message } => {
      let message = ControlMessage::from_json(&message)?;
      let reply = layer.handle_control(message).await;
      println!("{}", reply.to_json());
    }

    Command::Status => {
      let registration = layer.registration();
      let records = layer.store().records()?;
      if records.is_empty() {
        println!("No generations");
      }
      for record in records {
        let entries = layer.store().handle(&record.name).urls()?.len();
        println!(
          "{}  version={}  state={}  entries={}  created={}",
          record.name,
          record.version,
          registration.state_of(&record.version).unwrap_or(record.state),
          entries,
          record.created_at.format("%Y-%m-%d %H:%M:%S")
        );
      }
    }
  }

  Ok(())
}

fn parse_url(scope: &Url, raw: &str) -> Result<Url> {
  resolve_url(scope, raw).map_err(|e| eyre!("Invalid url '{}': {}", raw, e))
}
