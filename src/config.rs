use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::media::AudioRule;

/// Which extraction backend resolves URLs into streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Piped,
    Ytdlp,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "piped" => Ok(Self::Piped),
            "ytdlp" | "yt-dlp" => Ok(Self::Ytdlp),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub port: u16,
    pub bind_addr: String,
    pub backend: BackendKind,
    pub piped_api: String,
    pub temp_dir: PathBuf,
    pub temp_prefix: String,
    pub audio_rule: AudioRule,
    pub ytdlp_timeout: u64,
    pub cookies_path: Option<PathBuf>,
    pub connect_timeout: u64,
    pub download_timeout: u64,
    pub stale_max_age: u64,
    pub cleanup_interval: u64,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", 8000),
            bind_addr: env_str("BIND_ADDR", "0.0.0.0"),
            backend: env_parse("BACKEND", BackendKind::Piped),
            piped_api: env_str("PIPED_API", "https://pipedapi.kavin.rocks")
                .trim_end_matches('/')
                .to_string(),
            temp_dir: env::var("TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir()),
            temp_prefix: env_str("TEMP_PREFIX", "udl_"),
            audio_rule: env_parse("AUDIO_CONTAINER", AudioRule::Mp3OrM4a),
            ytdlp_timeout: env_parse("YTDLP_TIMEOUT", 30),
            cookies_path: env::var("COOKIES_PATH")
                .ok()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            connect_timeout: env_parse("CONNECT_TIMEOUT", 10),
            download_timeout: env_parse("DOWNLOAD_TIMEOUT", 0),
            stale_max_age: env_parse("STALE_MAX_AGE", 3600),
            cleanup_interval: env_parse("CLEANUP_INTERVAL", 900),
        }
    }

    /// Settings for tests: Piped backend at `piped_api`, work dirs under `temp_dir`.
    #[cfg(test)]
    pub fn for_tests(piped_api: &str, temp_dir: &std::path::Path) -> Self {
        Self {
            port: 0,
            bind_addr: "127.0.0.1".to_string(),
            backend: BackendKind::Piped,
            piped_api: piped_api.trim_end_matches('/').to_string(),
            temp_dir: temp_dir.to_path_buf(),
            temp_prefix: "udl_".to_string(),
            audio_rule: AudioRule::Mp3OrM4a,
            ytdlp_timeout: 30,
            cookies_path: None,
            connect_timeout: 5,
            download_timeout: 0,
            stale_max_age: 3600,
            cleanup_interval: 0,
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
