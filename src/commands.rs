//! CLI subcommands.

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use fetchq::cache::{CacheStorage, SqliteStorage};
use fetchq::transport::request_fn;
use fetchq::{
  Config, HttpTransport, Method, MutateOptions, OnlineManager, QueryClient, QueryFn, QueryKey,
  QueryState, Request, Transport,
};
use serde_json::Value;
use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Fetch targets concurrently; repeated targets share one request
  Fetch {
    #[arg(required = true)]
    targets: Vec<String>,

    /// Print every state transition to stderr
    #[arg(short, long)]
    watch: bool,
  },

  /// Send a write request
  Mutate {
    target: String,

    #[arg(short = 'X', long, default_value = "POST")]
    method: String,

    /// JSON request body
    #[arg(short = 'd', long)]
    body: Option<String>,

    /// Targets whose cached results become stale on success
    #[arg(long = "invalidate")]
    invalidates: Vec<String>,
  },

  /// Print the effective configuration
  Config,

  /// Inspect the on-disk cache
  #[command(subcommand)]
  Cache(CacheCommand),
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
  /// List persisted query results
  List,
  /// Delete all persisted query results
  Clear,
}

pub async fn run(command: Command, config: &Config, offline: bool) -> Result<()> {
  let mut out = std::io::stdout();
  match command {
    Command::Fetch { targets, watch } => {
      run_fetch(config, offline, &targets, watch, &mut out).await
    }
    Command::Mutate {
      target,
      method,
      body,
      invalidates,
    } => {
      let request = MutateRequest {
        target: &target,
        method: &method,
        body: body.as_deref(),
        invalidates: &invalidates,
      };
      run_mutate(config, offline, request, &mut out).await
    }
    Command::Config => {
      write!(out, "{}", serde_yaml::to_string(config)?)?;
      Ok(())
    }
    Command::Cache(command) => run_cache(config, command, &mut out),
  }
}

fn build_client(config: &Config, offline: bool) -> Result<(QueryClient, Arc<dyn Transport>)> {
  let mut builder = QueryClient::builder()
    .defaults(config.default_options.clone())
    .online_manager(OnlineManager::new(!offline));

  if config.storage.enabled {
    let path = config.storage_path()?;
    builder = builder.storage(Arc::new(SqliteStorage::open(&path)?));
  }

  let client = builder.build()?;
  let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
    &config.http,
    Config::auth_token().as_deref(),
  )?);
  Ok((client, transport))
}

async fn run_fetch(
  config: &Config,
  offline: bool,
  targets: &[String],
  watch: bool,
  out: &mut impl Write,
) -> Result<()> {
  let (client, transport) = build_client(config, offline)?;
  fetch_targets(&client, transport, targets, watch, out).await
}

async fn fetch_targets(
  client: &QueryClient,
  transport: Arc<dyn Transport>,
  targets: &[String],
  watch: bool,
  out: &mut impl Write,
) -> Result<()> {
  let can_fetch = client
    .defaults()
    .queries
    .network_mode
    .can_fetch(client.online_manager().is_online());

  let unique: BTreeSet<&String> = targets.iter().collect();
  let _subscriptions: Vec<_> = if watch {
    unique
      .iter()
      .map(|target| {
        let label = (*target).clone();
        client.subscribe(get_key(target), move |state| {
          eprintln!("{}: {}", label, describe_state(state));
        })
      })
      .collect()
  } else {
    Vec::new()
  };

  if !can_fetch {
    tracing::info!("Offline and network mode forbids fetching, serving cached data");
    let mut missing = 0;
    for target in &unique {
      let state = client.get_or_create(get_key(target)).state();
      match state.data() {
        Some(data) => writeln!(out, "{}", render(target, data, true)?)?,
        None => {
          missing += 1;
          eprintln!("{}: no cached data", target);
        }
      }
    }
    return if missing == 0 {
      Ok(())
    } else {
      Err(eyre!("{} of {} targets have no cached data", missing, unique.len()))
    };
  }

  let fetches = targets.iter().map(|target| {
    let request = Request::get(target.as_str());
    let key = request.query_key();
    let query_fn = request_fn(Arc::clone(&transport), request);
    async move {
      let result = fetch_target(client, key.clone(), query_fn).await;
      (target, key, result)
    }
  });
  let results = futures::future::join_all(fetches).await;

  let mut failed = 0;
  for (target, key, result) in results {
    match result {
      Ok(data) => writeln!(out, "{}", render(target, &data, false)?)?,
      Err(error) => {
        failed += 1;
        eprintln!("{}: {}", target, error);
        if let Some(data) = client.get_query_data(key) {
          writeln!(out, "{}", render(target, &data, true)?)?;
        }
      }
    }
  }

  if failed > 0 {
    return Err(eyre!("{} of {} fetches failed", failed, targets.len()));
  }
  Ok(())
}

/// Fetch one key. While offline, gives up with the last failure once a retry
/// is parked waiting for connectivity.
async fn fetch_target(
  client: &QueryClient,
  key: QueryKey,
  query_fn: QueryFn,
) -> fetchq::Result<Arc<Value>> {
  if client.online_manager().is_online() {
    return client.fetch_query(key, query_fn).await;
  }

  let (parked_tx, mut parked_rx) = watch::channel(None);
  let _subscription = client.subscribe(key.clone(), move |state| {
    if state.is_paused() && state.failure_count > 0 {
      parked_tx.send_replace(state.failure_reason.clone());
    }
  });

  tokio::select! {
    result = client.fetch_query(key, query_fn) => result,
    parked = parked_rx.wait_for(Option::is_some) => {
      let reason = parked.ok().and_then(|reason| reason.clone());
      Err(reason.unwrap_or_else(|| fetchq::Error::Network("offline".to_string())))
    }
  }
}

struct MutateRequest<'a> {
  target: &'a str,
  method: &'a str,
  body: Option<&'a str>,
  invalidates: &'a [String],
}

async fn run_mutate(
  config: &Config,
  offline: bool,
  request: MutateRequest<'_>,
  out: &mut impl Write,
) -> Result<()> {
  let (client, transport) = build_client(config, offline)?;
  if !config
    .default_options
    .mutations
    .network_mode
    .can_fetch(client.online_manager().is_online())
  {
    return Err(eyre!("Offline: the mutation network mode does not allow sending"));
  }

  let method: Method = request.method.parse()?;
  let body = request.body.map(parse_body).transpose()?;
  let options = MutateOptions {
    invalidates: request.invalidates.iter().map(|t| get_key(t)).collect(),
  };

  let mutation = client.mutate_with(
    request_fn(transport, Request::new(method, request.target, body)),
    options,
  );
  let data = mutation.wait().await?;
  writeln!(out, "{}", render(request.target, &data, false)?)?;
  Ok(())
}

fn run_cache(config: &Config, command: CacheCommand, out: &mut impl Write) -> Result<()> {
  let path = config.storage_path()?;
  let storage = SqliteStorage::open(&path)?;

  match command {
    CacheCommand::List => {
      let entries = storage.list()?;
      if entries.is_empty() {
        eprintln!("Cache at {} is empty", path.display());
      }
      for entry in entries {
        writeln!(
          out,
          "{}\t{}\t{} bytes",
          entry.updated_at.format("%Y-%m-%d %H:%M:%S"),
          entry.key,
          entry.data.to_string().len()
        )?;
      }
    }
    CacheCommand::Clear => {
      let removed = storage.clear()?;
      writeln!(out, "Removed {} cached results from {}", removed, path.display())?;
    }
  }
  Ok(())
}

fn get_key(target: &str) -> QueryKey {
  Request::get(target).query_key()
}

fn parse_body(body: &str) -> Result<Value> {
  serde_json::from_str(body).map_err(|e| eyre!("Request body is not valid JSON: {}", e))
}

fn describe_state(state: &QueryState) -> String {
  let mut text = format!("{:?}/{:?}", state.status, state.fetch_status).to_lowercase();
  if state.failure_count > 0 {
    text.push_str(&format!(" (failures: {})", state.failure_count));
  }
  if let Some(error) = &state.error {
    text.push_str(&format!(" - {}", error));
  }
  text
}

fn render(target: &str, data: &Value, stale: bool) -> Result<String> {
  let document = serde_json::json!({
    "target": target,
    "stale": stale,
    "data": data,
  });
  Ok(serde_json::to_string_pretty(&document)?)
}
