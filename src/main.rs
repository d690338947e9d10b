mod api;
mod auth;
mod db;
mod grading;
mod http;

use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// School management backend.
#[derive(Parser, Debug)]
#[command(name = "schoold", version, about)]
struct Args {
    /// Directory holding the SQLite database.
    #[arg(long, env = "SCHOOLD_WORKSPACE", default_value = "./data")]
    workspace: PathBuf,

    /// Address the HTTP server binds to.
    #[arg(long, env = "SCHOOLD_LISTEN", default_value = "127.0.0.1:8000")]
    listen: SocketAddr,

    /// Serve JSON-lines requests on stdin/stdout instead of HTTP.
    #[arg(long)]
    stdio: bool,

    #[arg(long, env = "ACCESS_TOKEN_SECRET", hide_env_values = true)]
    access_secret: String,

    #[arg(long, env = "REFRESH_TOKEN_SECRET", hide_env_values = true)]
    refresh_secret: String,

    /// Access token lifetime in minutes.
    #[arg(long, env = "SCHOOLD_ACCESS_TTL_MINUTES", default_value_t = 15)]
    access_ttl_minutes: i64,

    /// Refresh token lifetime in days.
    #[arg(long, env = "SCHOOLD_REFRESH_TTL_DAYS", default_value_t = 7)]
    refresh_ttl_days: i64,

    #[arg(long, env = "SCHOOLD_LOG", default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries responses in stdio mode.
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(false),
        )
        .init();
}

fn run_stdio(mut state: api::AppState) -> anyhow::Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = line.context("failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<api::Request>(&line) {
            Ok(req) => api::handle_request(&mut state, req),
            // No id to echo back.
            Err(e) => json!({
                "ok": false,
                "error": { "code": "bad_json", "message": e.to_string() },
            }),
        };
        writeln!(stdout, "{}", resp).context("failed to write stdout")?;
        stdout.flush().context("failed to flush stdout")?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let db = db::open_db(&args.workspace)
        .with_context(|| format!("failed to open workspace {}", args.workspace.display()))?;
    tracing::info!(workspace = %args.workspace.display(), "database ready");

    let tokens = auth::TokenKeys::new(
        &args.access_secret,
        &args.refresh_secret,
        chrono::Duration::minutes(args.access_ttl_minutes),
        chrono::Duration::days(args.refresh_ttl_days),
    );
    let state = api::AppState {
        workspace: args.workspace.clone(),
        db,
        tokens,
    };

    if args.stdio {
        return run_stdio(state);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(http::serve(state, args.listen))
}
