//! relay_client - capture-side CLI for the relay protocol
//!
//! Uploads source/target files, streams a directory of JPEG frames, and
//! fetches the processed result from a running `relayd`.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use capture_relay::CaptureClient;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Relay address.
    #[arg(long, env = "RELAY_ADDR", default_value = "127.0.0.1:8050")]
    addr: String,

    /// Read timeout in seconds (0 disables).
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: ClientCommand,
}

#[derive(Subcommand, Debug)]
enum ClientCommand {
    /// Upload the source image.
    SendSource { path: PathBuf },
    /// Upload the target media file.
    SendTarget { path: PathBuf },
    /// Upload source then target on one connection.
    Submit { source: PathBuf, target: PathBuf },
    /// Fetch a processed file.
    Request {
        /// Name to request; the relay default when omitted.
        #[arg(long)]
        name: Option<String>,
        /// Where to store the response.
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Stream every .jpg/.jpeg in a directory as live frames.
    Stream {
        dir: PathBuf,
        /// Delay between frames in milliseconds.
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,
    },
    /// Ask the relay to stop listening.
    Exit,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let timeout = (args.timeout_secs > 0).then(|| Duration::from_secs(args.timeout_secs));
    let mut client = CaptureClient::connect(args.addr.as_str(), timeout)
        .with_context(|| format!("connect {}", args.addr))?;

    match args.command {
        ClientCommand::SendSource { path } => {
            let ack = client.send_source(&path)?;
            log::info!("source uploaded ({} retries)", ack.retries);
        }
        ClientCommand::SendTarget { path } => {
            let ack = client.send_target(&path)?;
            log::info!("target uploaded ({} retries)", ack.retries);
        }
        ClientCommand::Submit { source, target } => {
            let ack = client.send_source(&source)?;
            log::info!("source uploaded ({} retries)", ack.retries);
            let ack = client.send_target(&target)?;
            log::info!("target uploaded ({} retries)", ack.retries);
        }
        ClientCommand::Request { name, out_dir } => {
            std::fs::create_dir_all(&out_dir)?;
            let path = client.request_file(name.as_deref(), &out_dir)?;
            log::info!("received {}", path.display());
        }
        ClientCommand::Stream { dir, interval_ms } => {
            stream_directory(&mut client, &dir, Duration::from_millis(interval_ms))?;
        }
        ClientCommand::Exit => {
            client.exit()?;
            log::info!("exit sent");
        }
    }
    client.finish()?;
    Ok(())
}

fn stream_directory(
    client: &mut CaptureClient<TcpStream>,
    dir: &Path,
    interval: Duration,
) -> Result<()> {
    let mut frames: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("read {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
        })
        .collect();
    if frames.is_empty() {
        return Err(anyhow!("no JPEG frames in {}", dir.display()));
    }
    frames.sort();

    client.start_frames()?;
    for (idx, path) in frames.iter().enumerate() {
        let jpeg = std::fs::read(path)?;
        client.send_frame(&jpeg)?;
        log::debug!("sent frame {} ({})", idx + 1, path.display());
        std::thread::sleep(interval);
    }
    log::info!("streamed {} frames from {}", frames.len(), dir.display());
    Ok(())
}
