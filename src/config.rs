use anyhow::{Context, Result};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::ffmpeg::Tools;
use crate::resolver::DEFAULT_API_BASE_URL;
use crate::server::queue::{DEFAULT_PROBE_TIMEOUT, QueueSettings};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/zt-dl-env";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub output_dir: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub api_base_url: Option<String>,
    pub session_cookie: Option<String>,
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
    pub probe_timeout_secs: Option<u64>,
    pub download_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub output_dir: PathBuf,
    pub www_root: Option<PathBuf>,
    pub port: u16,
    pub host: String,
    pub api_base_url: String,
    pub session_cookie: Option<String>,
    pub tools: Tools,
    pub probe_timeout: Duration,
    pub download_timeout: Option<Duration>,
}

impl RuntimeConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            tools: self.tools.clone(),
            probe_timeout: self.probe_timeout,
            download_timeout: self.download_timeout,
            ..QueueSettings::default()
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str, path: &Path) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("Parsing {key} from {}", path.display()))
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let key = key.trim();
            let value = value_raw.trim().trim_matches('"');
            match key {
                "OUTPUT_DIR" => cfg.output_dir = non_empty(value).map(PathBuf::from),
                "WWW_ROOT" => cfg.www_root = non_empty(value).map(PathBuf::from),
                "ZT_DL_PORT" => cfg.port = Some(parse_number(key, value, path)?),
                "ZT_DL_HOST" => cfg.host = non_empty(value),
                "API_BASE_URL" => cfg.api_base_url = non_empty(value),
                "SESSION_COOKIE" => cfg.session_cookie = non_empty(value),
                "FFMPEG_PATH" => cfg.ffmpeg_path = non_empty(value).map(PathBuf::from),
                "FFPROBE_PATH" => cfg.ffprobe_path = non_empty(value).map(PathBuf::from),
                "PROBE_TIMEOUT_SECS" => {
                    cfg.probe_timeout_secs = Some(parse_number(key, value, path)?)
                }
                "DOWNLOAD_TIMEOUT_SECS" => {
                    cfg.download_timeout_secs = Some(parse_number(key, value, path)?)
                }
                _ => {}
            }
        }
    }
    Ok(Some(cfg))
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    load_runtime_config_from(Path::new(DEFAULT_CONFIG_PATH))
}

/// A missing file is not an error; every setting then takes its default.
pub fn load_runtime_config_from(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
    let path = path.as_ref();
    let cfg = read_env_config(path)?.unwrap_or_default();
    let output_dir = match cfg.output_dir {
        Some(dir) => dir,
        None => env::current_dir().context("Resolving current directory")?,
    };
    let defaults = Tools::default();
    Ok(RuntimeConfig {
        output_dir,
        www_root: cfg.www_root,
        port: cfg.port.unwrap_or(DEFAULT_PORT),
        host: cfg.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
        api_base_url: cfg
            .api_base_url
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
        session_cookie: cfg.session_cookie,
        tools: Tools {
            ffmpeg: cfg.ffmpeg_path.unwrap_or(defaults.ffmpeg),
            ffprobe: cfg.ffprobe_path.unwrap_or(defaults.ffprobe),
        },
        probe_timeout: cfg
            .probe_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PROBE_TIMEOUT),
        download_timeout: cfg
            .download_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs),
    })
}
