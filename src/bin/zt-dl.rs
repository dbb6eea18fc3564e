#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::{path::PathBuf, sync::Arc};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use zt_dl::{
    config::{DEFAULT_CONFIG_PATH, RuntimeConfig, load_runtime_config_from},
    ffmpeg::{ConsoleProgress, Downloadable, ProgressSink, executables_present},
    resolver::{RecordingLibrary, StreamResolver, WatchUrlResolver, ready_recordings},
    server,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Download recordings and watch the queue from a browser.")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the web UI, the download queue and its event stream.
    Serve {
        #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the config file")]
        config: PathBuf,
        #[arg(
            long = "outdir",
            value_name = "DIR",
            help = "Directory downloads are written to"
        )]
        outdir: Option<PathBuf>,
        #[arg(long = "port", value_name = "PORT", help = "Port to listen on")]
        port: Option<u16>,
        #[arg(long = "host", value_name = "HOST", help = "Address to bind to")]
        host: Option<String>,
        #[arg(long = "open", help = "Open the web UI in the default browser")]
        open: bool,
    },
    /// List the recordings that are ready to download.
    #[command(alias = "list-recordings")]
    List {
        #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the config file")]
        config: PathBuf,
    },
    /// Download a single recording in the foreground.
    Download {
        #[arg(long = "rid", value_name = "ID", help = "Recording id")]
        recording_id: i64,
        #[arg(long = "out", value_name = "FILE", help = "Output file")]
        output: PathBuf,
        #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the config file")]
        config: PathBuf,
    },
    /// Check that ffmpeg and ffprobe can be run.
    Check {
        #[arg(long = "config", value_name = "PATH", default_value = DEFAULT_CONFIG_PATH, help = "Path to the config file")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    match cli.command {
        Command::Serve {
            config,
            outdir,
            port,
            host,
            open,
        } => {
            let mut runtime = load_runtime_config_from(&config)?;
            if let Some(outdir) = outdir {
                runtime.output_dir = outdir;
            }
            if let Some(port) = port {
                runtime.port = port;
            }
            if let Some(host) = host {
                runtime.host = host;
            }
            executables_present(&runtime.tools)?;
            if open {
                tokio::spawn(open_browser(browser_url(&runtime)));
            }
            let client = client(&runtime);
            server::serve(&runtime, client.clone(), client, cancel).await
        }
        Command::List { config } => {
            let runtime = load_runtime_config_from(&config)?;
            let recordings = client(&runtime)
                .list_recordings()
                .await
                .context("listing recordings")?;
            println!("Ready recordings:");
            for (index, recording) in ready_recordings(&recordings, Utc::now())
                .into_iter()
                .enumerate()
            {
                println!("{index:4}: {}", recording.describe());
            }
            Ok(())
        }
        Command::Download {
            recording_id,
            output,
            config,
        } => {
            let runtime = load_runtime_config_from(&config)?;
            executables_present(&runtime.tools)?;
            download_one(&runtime, recording_id, output, &cancel).await
        }
        Command::Check { config } => {
            let runtime = load_runtime_config_from(&config)?;
            executables_present(&runtime.tools)?;
            println!(
                "ffmpeg: {}\nffprobe: {}",
                runtime.tools.ffmpeg.display(),
                runtime.tools.ffprobe.display()
            );
            Ok(())
        }
    }
}

fn client(runtime: &RuntimeConfig) -> Arc<WatchUrlResolver> {
    Arc::new(WatchUrlResolver::new(
        runtime.api_base_url.clone(),
        runtime.session_cookie.clone(),
    ))
}

async fn download_one(
    runtime: &RuntimeConfig,
    recording_id: i64,
    output: PathBuf,
    cancel: &CancellationToken,
) -> Result<()> {
    if output.exists() {
        bail!("{} already exists", output.display());
    }

    let url = client(runtime)
        .resolve_recording(recording_id)
        .await
        .with_context(|| format!("resolving recording {recording_id}"))?;

    let mut downloadable = Downloadable::new(url, &output, runtime.tools.clone());
    tokio::time::timeout(runtime.probe_timeout, downloadable.detect_streams(cancel))
        .await
        .context("probing timed out")?
        .context("probing recording")?;

    let sink: Arc<dyn ProgressSink> = Arc::new(ConsoleProgress);
    downloadable
        .download(sink, cancel)
        .await
        .with_context(|| format!("downloading to {}", output.display()))?;
    info!(output = %output.display(), "download complete");
    Ok(())
}

fn browser_url(runtime: &RuntimeConfig) -> String {
    let host = match runtime.host.as_str() {
        "0.0.0.0" | "::" | "[::]" => "localhost",
        host => host,
    };
    format!("http://{host}:{}/", runtime.port)
}

async fn open_browser(url: String) {
    let mut command = if cfg!(target_os = "windows") {
        let mut command = tokio::process::Command::new("cmd");
        command.args(["/c", "start", url.as_str()]);
        command
    } else if cfg!(target_os = "macos") {
        let mut command = tokio::process::Command::new("open");
        command.arg(&url);
        command
    } else {
        let mut command = tokio::process::Command::new("xdg-open");
        command.arg(&url);
        command
    };
    match command.status().await {
        Ok(status) if status.success() => info!(%url, "opened web UI"),
        Ok(status) => warn!(%url, "browser launcher exited with {status}"),
        Err(err) => warn!(%url, "failed to open browser: {err}"),
    }
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("shutting down");
            cancel.cancel();
        }
        Err(err) => error!("failed to install Ctrl+C handler: {err}"),
    }
}
