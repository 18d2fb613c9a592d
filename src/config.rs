use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::command::DEFAULT_COMMAND_READ_LIMIT;
use crate::frame::DEFAULT_MAX_FRAME_BYTES;
use crate::layout::{DirectoryResolution, ResponseFormat};
use crate::server::ServerConfig;
use crate::session::SessionProfile;
use crate::transfer::{RetryPolicy, DEFAULT_CHUNK_SIZE};

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8050";
const DEFAULT_SOURCE_DIR: &str = "output/source";
const DEFAULT_TARGET_DIR: &str = "output/target";
const DEFAULT_OUTPUT_DIR: &str = "output/swapped";
const DEFAULT_OUTPUT_FILE: &str = "swapped.jpg";
const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Deserialize, Default)]
struct RelayConfigFile {
    listen_addr: Option<String>,
    response_format: Option<ResponseFormat>,
    stop_on_exit: Option<bool>,
    layout: Option<LayoutConfigFile>,
    transfer: Option<TransferConfigFile>,
    stream: Option<StreamConfigFile>,
    timeouts: Option<TimeoutConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct LayoutConfigFile {
    mode: Option<LayoutMode>,
    source: Option<PathBuf>,
    target: Option<PathBuf>,
    output: Option<PathBuf>,
    output_file: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TransferConfigFile {
    max_retries: Option<u32>,
    backoff_ms: Option<u64>,
    chunk_size: Option<usize>,
    command_read_limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    max_frame_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct TimeoutConfigFile {
    read_secs: Option<u64>,
    write_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutMode {
    /// Per-kind directories; announced file names are kept.
    #[default]
    Folders,
    /// Fixed file paths; announced names are ignored.
    Fixed,
}

#[derive(Debug, Clone)]
pub struct LayoutSettings {
    pub mode: LayoutMode,
    /// Source directory (folders) or source file (fixed).
    pub source: PathBuf,
    pub target: PathBuf,
    pub output: PathBuf,
    /// Default name served for `REQUEST_FILE` in folders mode.
    pub output_file: String,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: String,
    pub layout: LayoutSettings,
    pub response_format: ResponseFormat,
    pub retry: RetryPolicy,
    pub chunk_size: usize,
    pub command_read_limit: usize,
    pub max_frame_bytes: usize,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub stop_on_exit: bool,
}

impl RelayConfig {
    /// Load from `RELAY_CONFIG` (if set), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("RELAY_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => RelayConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RelayConfigFile) -> Result<Self> {
        let layout_file = file.layout.unwrap_or_default();
        let mode = layout_file.mode.unwrap_or_default();
        let layout = match mode {
            LayoutMode::Folders => LayoutSettings {
                mode,
                source: layout_file
                    .source
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SOURCE_DIR)),
                target: layout_file
                    .target
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_TARGET_DIR)),
                output: layout_file
                    .output
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
                output_file: layout_file
                    .output_file
                    .unwrap_or_else(|| DEFAULT_OUTPUT_FILE.to_string()),
            },
            LayoutMode::Fixed => {
                let (Some(source), Some(target), Some(output)) =
                    (layout_file.source, layout_file.target, layout_file.output)
                else {
                    return Err(anyhow!(
                        "fixed layout requires source, target and output paths"
                    ));
                };
                LayoutSettings {
                    mode,
                    source,
                    target,
                    output,
                    output_file: layout_file
                        .output_file
                        .unwrap_or_else(|| DEFAULT_OUTPUT_FILE.to_string()),
                }
            }
        };

        let transfer = file.transfer.unwrap_or_default();
        let timeouts = file.timeouts.unwrap_or_default();
        Ok(Self {
            listen_addr: file
                .listen_addr
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string()),
            layout,
            response_format: file.response_format.unwrap_or_default(),
            retry: RetryPolicy {
                max_retries: transfer.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
                backoff: Duration::from_millis(transfer.backoff_ms.unwrap_or(0)),
            },
            chunk_size: transfer.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            command_read_limit: transfer
                .command_read_limit
                .unwrap_or(DEFAULT_COMMAND_READ_LIMIT),
            max_frame_bytes: file
                .stream
                .and_then(|stream| stream.max_frame_bytes)
                .unwrap_or(DEFAULT_MAX_FRAME_BYTES),
            read_timeout: timeouts
                .read_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            write_timeout: timeouts
                .write_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            stop_on_exit: file.stop_on_exit.unwrap_or(true),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("RELAY_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(path) = non_empty_env("RELAY_SOURCE_DIR") {
            self.layout.source = PathBuf::from(path);
        }
        if let Some(path) = non_empty_env("RELAY_TARGET_DIR") {
            self.layout.target = PathBuf::from(path);
        }
        if let Some(path) = non_empty_env("RELAY_OUTPUT_DIR") {
            self.layout.output = PathBuf::from(path);
        }
        if let Some(name) = non_empty_env("RELAY_OUTPUT_FILE") {
            self.layout.output_file = name;
        }
        if let Some(retries) = non_empty_env("RELAY_MAX_RETRIES") {
            self.retry.max_retries = retries
                .parse()
                .map_err(|_| anyhow!("RELAY_MAX_RETRIES must be a non-negative integer"))?;
        }
        if let Some(backoff) = non_empty_env("RELAY_RETRY_BACKOFF_MS") {
            let millis: u64 = backoff.parse().map_err(|_| {
                anyhow!("RELAY_RETRY_BACKOFF_MS must be an integer number of milliseconds")
            })?;
            self.retry.backoff = Duration::from_millis(millis);
        }
        if let Some(secs) = non_empty_env("RELAY_READ_TIMEOUT_SECS") {
            self.read_timeout = parse_timeout("RELAY_READ_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = non_empty_env("RELAY_WRITE_TIMEOUT_SECS") {
            self.write_timeout = parse_timeout("RELAY_WRITE_TIMEOUT_SECS", &secs)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| anyhow!("invalid listen address '{}': {}", self.listen_addr, e))?;
        if self.chunk_size == 0 {
            return Err(anyhow!("chunk_size must be greater than zero"));
        }
        if self.command_read_limit == 0 {
            return Err(anyhow!("command_read_limit must be greater than zero"));
        }
        if self.max_frame_bytes == 0 {
            return Err(anyhow!("max_frame_bytes must be greater than zero"));
        }
        if self.layout.mode == LayoutMode::Folders {
            crate::layout::base_name(&self.layout.output_file)
                .map_err(|_| anyhow!("invalid output file name '{}'", self.layout.output_file))?;
        }
        Ok(())
    }

    pub fn resolution(&self) -> DirectoryResolution {
        match self.layout.mode {
            LayoutMode::Folders => DirectoryResolution::Folders {
                source_dir: self.layout.source.clone(),
                target_dir: self.layout.target.clone(),
                output_dir: self.layout.output.clone(),
                output_file: self.layout.output_file.clone(),
            },
            LayoutMode::Fixed => DirectoryResolution::FixedFiles {
                source_file: self.layout.source.clone(),
                target_file: self.layout.target.clone(),
                output_file: self.layout.output.clone(),
            },
        }
    }

    pub fn session_profile(&self) -> SessionProfile {
        SessionProfile {
            layout: self.resolution(),
            response_format: self.response_format,
            retry: self.retry,
            chunk_size: self.chunk_size,
            command_read_limit: self.command_read_limit,
            max_frame_bytes: self.max_frame_bytes,
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            addr: self.listen_addr.clone(),
            profile: self.session_profile(),
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            stop_on_exit: self.stop_on_exit,
            stop_after_ready: false,
        }
    }
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// `0` disables the timeout.
fn parse_timeout(key: &str, value: &str) -> Result<Option<Duration>> {
    let secs: u64 = value
        .trim()
        .parse()
        .map_err(|_| anyhow!("{} must be an integer number of seconds", key))?;
    Ok((secs > 0).then(|| Duration::from_secs(secs)))
}
