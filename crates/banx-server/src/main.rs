use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use banx_bridge::{
    BanxService, CgiBridge, ExecuteError, ServerConfig, VersionInfo, WorkerChannel, transport,
};

const USAGE: &str = "\
Usage: banx-server [--host <addr>] [--port <port>]
       banx-server sage-shell

Commands:
  sage-shell       Read code from stdin, run it in the worker and print the variables

Options:
  --host <addr>    Address or hostname to bind [env HOST, default: 0.0.0.0]
  --port <port>    Port to listen on [env PORT, default: 3000]
  -h, --help       Show this help

Environment (also read from ./.env):
  REPO_DIR, GIT_HTTP_BACKEND, SAGE_SERVER_PATH, SAGE_TIMEOUT_MS,
  REMOTE_USER_HEADER, AWAIT_EXPLICIT_SHUTDOWN, BANX_LOG, LOG_FORMAT";

const PROMPT: &str = "sage: ";

#[derive(Debug, Default, PartialEq, Eq)]
struct Overrides {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, PartialEq, Eq)]
enum Mode {
    Serve(Overrides),
    SageShell,
}

/// Initialize tracing with BANX_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("BANX_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("banx_bridge={level},banx_server={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_args(args: &[String]) -> Result<Mode, String> {
    if args.get(1).map(String::as_str) == Some("sage-shell") {
        return match args.get(2).map(String::as_str) {
            None => Ok(Mode::SageShell),
            Some("--help" | "-h") => Err(String::new()),
            Some(arg) => Err(format!("unexpected argument to sage-shell: {arg}")),
        };
    }

    let mut overrides = Overrides::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                overrides.host = Some(args.get(i).ok_or("--host requires a value")?.clone());
            }
            "--port" => {
                i += 1;
                let port = args.get(i).ok_or("--port requires a value")?;
                let port = port
                    .parse::<u16>()
                    .map_err(|e| format!("invalid --port '{port}': {e}"))?;
                overrides.port = Some(port);
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }
    Ok(Mode::Serve(overrides))
}

/// Load `./.env` into the process environment. Variables already set win.
fn load_dotenv() -> Option<PathBuf> {
    match dotenvy::dotenv() {
        Ok(path) => Some(path),
        Err(e) if e.not_found() => None,
        Err(e) => {
            eprintln!("warning: ignoring .env: {e}");
            None
        }
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let mode = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if msg.is_empty() {
                println!("{USAGE}");
                process::exit(0);
            }
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    let dotenv = load_dotenv();
    init_tracing();
    if let Some(path) = dotenv {
        tracing::debug!(path = %path.display(), "Loaded environment file");
    }

    let result = match mode {
        Mode::Serve(overrides) => run(overrides).await,
        Mode::SageShell => run_sage_shell().await,
    };
    if let Err(e) = result {
        tracing::error!(error = %format!("{e:#}"), "banx-server failed");
        process::exit(1);
    }
}

fn start_worker(config: &ServerConfig) -> anyhow::Result<WorkerChannel> {
    WorkerChannel::start(config.worker_config()).with_context(|| {
        format!(
            "failed to start computation worker {}",
            config.sage_server_path.display()
        )
    })
}

async fn run(overrides: Overrides) -> anyhow::Result<()> {
    let mut config = ServerConfig::from_env()?;
    if let Some(host) = overrides.host {
        config.host = host;
    }
    if let Some(port) = overrides.port {
        config.port = port;
    }
    tracing::debug!(?config, "Loaded configuration");

    let worker = start_worker(&config)?;
    let service = BanxService::new(Arc::new(worker), CgiBridge::new(config.cgi_config()))
        .with_remote_user_header(config.remote_user_header.clone())
        .with_version(VersionInfo::new());

    transport::serve(&config, Arc::new(service)).await
}

async fn run_sage_shell() -> anyhow::Result<()> {
    let config = ServerConfig::from_env()?;
    let worker = start_worker(&config)?;

    let result = sage_shell(
        &worker,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await;
    worker.shutdown().await;
    result
}

/// Run each non-blank input line in the worker and print the variables it
/// reports, or the error message. Ends at end of input.
async fn sage_shell<R, W>(worker: &WorkerChannel, input: R, mut output: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    loop {
        output.write_all(PROMPT.as_bytes()).await?;
        output.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let code = line.trim();
        if code.is_empty() {
            continue;
        }

        let text = match worker.execute(code).await {
            Ok(variables) => serde_json::to_string_pretty(&variables)?,
            Err(ExecuteError::Worker(message)) => message,
            Err(e) => e.to_string(),
        };
        output.write_all(text.as_bytes()).await?;
        output.write_all(b"\n").await?;
    }

    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}
