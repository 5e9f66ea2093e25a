mod app;
mod cache;
mod client;
mod config;
mod db;
mod http;
mod logging;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::Serialize;
use std::path::PathBuf;

use crate::client::NavigationDecision;
use crate::http::{Request, Response};

#[derive(Parser, Debug)]
#[command(name = "storefront-offline")]
#[command(about = "Offline cache engine and navigation layer for the AI Store storefront")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/storefront-offline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Storefront origin, overriding the config file
  #[arg(short, long)]
  origin: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install or restore the worker and show its state
  Install,
  /// Load a URL through the worker
  Fetch {
    url: String,
    /// Treat as a full page load
    #[arg(long)]
    navigate: bool,
    #[arg(long, default_value = "GET")]
    method: String,
    /// Extra request header, `name: value`
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Request body
    #[arg(long)]
    data: Option<String>,
  },
  /// Ask the worker for its version
  Version,
  /// Entry counts of the current caches
  Info,
  /// Fetch URLs into the dynamic cache
  CacheUrls {
    #[arg(required = true)]
    urls: Vec<String>,
  },
  /// Report which cache holds a URL
  Check { url: String },
  /// Refetch the static manifest
  Update,
  /// Delete the current caches
  Clear,
  /// Activate a waiting worker version now
  SkipWaiting,
  /// Remove the worker registration and its recorded version
  Unregister,
  /// Report whether offline mode can work
  Status,
  /// Clear the caches and all offline client storage
  Reset,
  /// Decide whether a page can be shown
  Route {
    path: String,
    /// Evaluate as if the connection were down
    #[arg(long)]
    offline: bool,
  },
  /// Call an API endpoint through the offline-aware fetch wrapper
  Api {
    path: String,
    #[arg(long)]
    offline: bool,
  },
  /// Inspect the local product and user mirror
  OfflineData {
    #[command(subcommand)]
    action: OfflineDataAction,
  },
}

#[derive(Subcommand, Debug)]
enum OfflineDataAction {
  Show,
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override origin if specified on command line
  let config = if let Some(origin) = args.origin {
    config::Config { origin, ..config }
  } else {
    config
  };

  let _guard = logging::init(&config.log)?;

  let online = !matches!(
    args.command,
    Command::Route { offline: true, .. } | Command::Api { offline: true, .. }
  );
  let app = app::App::new(config, online).await?;
  let result = run(&app, args.command).await;
  app.shutdown().await;
  result
}

async fn run(app: &app::App, command: Command) -> Result<()> {
  match command {
    Command::Install => {
      let worker = app
        .registration()
        .active()
        .ok_or_else(|| eyre!("No active worker; installation failed"))?;
      println!("version: {}", worker.version());
      println!("state:   {}", worker.state());
      print_json(&worker.cache_info()?)?;
    }
    Command::Fetch {
      url,
      navigate,
      method,
      headers,
      data,
    } => {
      let url = app.resolve(&url)?;
      let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method {}: {}", method, e))?;
      let mut request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      }
      .with_method(method);
      for header in &headers {
        let (name, value) = header
          .split_once(':')
          .ok_or_else(|| eyre!("Invalid header '{}', expected name: value", header))?;
        request = request.with_header(name.trim(), value.trim());
      }
      if let Some(data) = data {
        request = request.with_body(data);
      }
      print_response(&app.fetch(&request).await?);
    }
    Command::Version => println!("{}", app.client().version().await?),
    Command::Info => print_json(&app.client().cache_info().await?)?,
    Command::CacheUrls { urls } => print_json(&app.client().cache_urls(urls).await?)?,
    Command::Check { url } => print_json(&app.client().check_resource(&url).await?)?,
    Command::Update => {
      app.client().update_cache().await?;
      println!("Static cache refreshed");
    }
    Command::Clear => println!("Removed {} caches", app.clear_caches()?),
    Command::SkipWaiting => {
      if app.skip_waiting().await? {
        println!("Waiting worker asked to activate");
      } else {
        println!("No waiting worker");
      }
    }
    Command::Unregister => {
      if app.unregister()? {
        println!("Worker unregistered");
      } else {
        println!("No worker was registered");
      }
    }
    Command::Status => print_json(&app.offline_support()?)?,
    Command::Reset => println!("Removed {} caches and cleared offline data", app.reset()?),
    Command::Route { path, offline } => {
      if offline {
        app.set_online(false);
      }
      println!("available offline: {}", app.is_available_offline(&path));
      let (decision, response) = app.navigate(&path).await?;
      match decision {
        NavigationDecision::Proceed => println!("navigate: {}", path),
        NavigationDecision::RedirectOffline(target) => println!("redirect: {}", target),
      }
      println!("status: {}", response.status);
    }
    Command::Api { path, offline } => {
      if offline {
        app.set_online(false);
      }
      let request = Request::get(app.resolve(&path)?);
      print_response(&app.api(&request).await?);
    }
    Command::OfflineData { action } => match action {
      OfflineDataAction::Show => print_json(&app.offline().snapshot())?,
      OfflineDataAction::Clear => {
        app.offline().clear()?;
        println!("Offline data cleared");
      }
    },
  }
  Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let json =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format output: {}", e))?;
  println!("{}", json);
  Ok(())
}

fn print_response(response: &Response) {
  println!("status: {}", response.status);
  for (name, value) in &response.headers {
    println!("{}: {}", name, value);
  }
  println!();
  println!("{}", response.text());
}
