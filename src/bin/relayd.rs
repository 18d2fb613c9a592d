//! relayd - processing-host side of the capture relay
//!
//! This daemon:
//! 1. Loads configuration (file + environment, then command-line overrides)
//! 2. Accepts one capture client at a time
//! 3. Stores uploaded source/target files and decodes live frames
//! 4. In batch mode, hands each ready pair off and starts a new cycle

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;

use capture_relay::{
    DecodedFrame, FrameControl, Processor, ReadySignal, ReceivedFiles, RelayConfig, RelayServer,
    ShutdownHandle,
};

const FRAME_LOG_INTERVAL: u64 = 100;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (.toml or .json).
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file.
    #[arg(long)]
    listen: Option<String>,

    /// Wait for each ready pair, hand it off, then listen again.
    #[arg(long)]
    batch: bool,
}

#[derive(Default)]
struct LoggingProcessor {
    frames: u64,
}

impl Processor for LoggingProcessor {
    fn on_frame(&mut self, frame: DecodedFrame) -> FrameControl {
        self.frames += 1;
        if self.frames % FRAME_LOG_INTERVAL == 1 {
            log::info!(
                "live frame {} ({}x{})",
                self.frames,
                frame.width,
                frame.height
            );
        }
        FrameControl::Continue
    }

    fn on_ready(&mut self, files: &ReceivedFiles) {
        log::info!(
            "inputs ready: source={} target={}",
            display_path(files.source.as_ref()),
            display_path(files.target.as_ref())
        );
    }
}

fn display_path(path: Option<&PathBuf>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = RelayConfig::load_from(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
        config.validate()?;
    }
    if args.batch {
        config.stop_on_exit = false;
    }

    let shutdown = ShutdownHandle::new();
    let ready = ReadySignal::new();
    {
        let shutdown = shutdown.clone();
        let ready = ready.clone();
        ctrlc::set_handler(move || {
            shutdown.request();
            ready.cancel();
        })
        .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;
    }

    if args.batch {
        run_batch(&config, &ready, &shutdown)
    } else {
        let stats = RelayServer::new(config.server_config(), LoggingProcessor::default())
            .with_ready_signal(ready)
            .with_shutdown(shutdown)
            .run()?;
        log::info!(
            "relayd stopped: sessions={}, ready={}, failed={}",
            stats.sessions,
            stats.ready_sessions,
            stats.failed_sessions
        );
        Ok(())
    }
}

/// One ready hand-off per listening cycle.
fn run_batch(config: &RelayConfig, ready: &ReadySignal, shutdown: &ShutdownHandle) -> Result<()> {
    let mut server_config = config.server_config();
    server_config.stop_after_ready = true;
    let mut cycle = 0u64;
    loop {
        cycle += 1;
        let handle = RelayServer::new(server_config.clone(), LoggingProcessor::default())
            .with_ready_signal(ready.clone())
            .with_shutdown(shutdown.clone())
            .spawn()?;
        log::info!("batch cycle {} listening on {}", cycle, handle.addr);

        let files = ready.wait();
        // The listener has already stopped after the hand-off, or is stopping
        // because shutdown was requested.
        let stats = handle.wait()?;
        match files {
            Some(files) => {
                log::info!(
                    "batch cycle {} complete after {} session(s): source={} target={}",
                    cycle,
                    stats.sessions,
                    display_path(files.source.as_ref()),
                    display_path(files.target.as_ref())
                );
            }
            None => {
                log::info!("shutdown signal received, stopping relayd");
                return Ok(());
            }
        }
    }
}
