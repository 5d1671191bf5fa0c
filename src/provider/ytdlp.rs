#![cfg_attr(not(feature = "ytdlp"), allow(dead_code))]

use std::path::PathBuf;

use serde_json::Value;

use super::ResolvedMedia;
use crate::error::{ProviderError, Result};
use crate::media::{is_known_extension, MediaStream, StreamKind};

#[cfg(feature = "ytdlp")]
pub use self::backend::YtdlpProvider;

/// Turn a yt-dlp info dict into streams the relay can serve.
///
/// Formats whose extension has no MIME mapping are skipped; everything else
/// keeps yt-dlp's order.
pub fn parse_info(info: &Value) -> Result<ResolvedMedia> {
    let title = str_field(info, "title")
        .or_else(|| str_field(info, "fulltitle"))
        .ok_or_else(|| ProviderError::Extraction("Could not fetch video data".to_string()))?;

    let streams = info["formats"]
        .as_array()
        .map(|formats| formats.iter().filter_map(parse_format).collect())
        .unwrap_or_default();

    Ok(ResolvedMedia {
        title,
        thumbnail_url: str_field(info, "thumbnail"),
        streams,
    })
}

fn parse_format(fmt: &Value) -> Option<MediaStream> {
    let id = str_field(fmt, "format_id")?;
    let ext = fmt["ext"].as_str().unwrap_or("").to_ascii_lowercase();
    if !is_known_extension(&ext) {
        return None;
    }

    let vcodec = fmt["vcodec"].as_str().unwrap_or("none");
    let acodec = fmt["acodec"].as_str().unwrap_or("none");
    let kind = if vcodec == "none" && acodec != "none" {
        StreamKind::Audio
    } else {
        StreamKind::Video
    };

    let size_bytes = [&fmt["filesize"], &fmt["filesize_approx"]]
        .into_iter()
        .find_map(|v| v.as_u64().or_else(|| v.as_f64().filter(|n| *n > 0.0).map(|n| n as u64)))
        .unwrap_or(0);

    let resolution_label = str_field(fmt, "resolution")
        .or_else(|| fmt["height"].as_i64().map(|h| h.to_string()))
        .unwrap_or_else(|| "N/A".to_string());

    Some(MediaStream {
        id,
        kind,
        extension: ext,
        resolution_label,
        size_bytes,
        direct_url: None,
    })
}

/// Final file path reported by a downloading `extract_info` call.
pub fn downloaded_path(info: &Value) -> Option<PathBuf> {
    info["requested_downloads"]
        .as_array()?
        .first()?
        .get("filepath")?
        .as_str()
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v[key]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

#[cfg(feature = "ytdlp")]
mod backend {
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use async_trait::async_trait;
    use tracing::error;

    use super::super::python;
    use super::{downloaded_path, parse_info};
    use crate::cleanup::link_blocking_writer;
    use crate::error::{ProviderError, Result};
    use crate::media::MediaStream;
    use crate::provider::{MediaProvider, ResolvedMedia};

    /// Local extraction through the yt-dlp Python library (PyO3).
    pub struct YtdlpProvider {
        cookies_path: Option<PathBuf>,
        extract_timeout: Duration,
    }

    impl YtdlpProvider {
        pub fn new(cookies_path: Option<PathBuf>, extract_timeout_secs: u64) -> Self {
            Self {
                cookies_path,
                extract_timeout: Duration::from_secs(extract_timeout_secs),
            }
        }
    }

    fn parse_json(json_str: &str) -> Result<serde_json::Value> {
        serde_json::from_str(json_str).map_err(|e| {
            error!("JSON parse error: {e}");
            ProviderError::Extraction("Failed to parse extraction result".to_string())
        })
    }

    #[async_trait]
    impl MediaProvider for YtdlpProvider {
        fn name(&self) -> &'static str {
            "ytdlp"
        }

        async fn resolve(&self, url: &str) -> Result<ResolvedMedia> {
            let url = url.to_string();
            let cookies = self.cookies_path.clone();

            let result = tokio::time::timeout(
                self.extract_timeout,
                tokio::task::spawn_blocking(move || {
                    python::extract_info(&url, cookies.as_deref())
                }),
            )
            .await;

            let json_str = match result {
                Ok(Ok(Ok(json))) => json,
                Ok(Ok(Err(e))) => return Err(ProviderError::Extraction(e)),
                Ok(Err(e)) => {
                    error!("Task join error: {e}");
                    return Err(ProviderError::Extraction("Internal server error".to_string()));
                }
                Err(_) => {
                    return Err(ProviderError::Extraction(
                        "Request timeout after extraction took too long".to_string(),
                    ))
                }
            };

            parse_info(&parse_json(&json_str)?)
        }

        async fn fetch(
            &self,
            url: &str,
            stream: &MediaStream,
            work_dir: &Path,
            _file_name: &str,
        ) -> Result<PathBuf> {
            let url = url.to_string();
            let format_id = stream.id.clone();
            let dir = work_dir.to_path_buf();
            let cookies = self.cookies_path.clone();

            // yt-dlp recreates missing parent dirs; if this future is
            // dropped mid-download the blocking side removes the dir again.
            let (watch, link) = link_blocking_writer(work_dir);
            let joined = tokio::task::spawn_blocking(move || {
                let result = python::download(&url, &format_id, &dir, cookies.as_deref());
                link.finish();
                result
            })
            .await;
            watch.disarm();

            let json_str = joined
                .map_err(|e| ProviderError::Fetch(format!("Task join error: {e}")))?
                .map_err(ProviderError::Fetch)?;

            downloaded_path(&parse_json(&json_str)?)
                .ok_or_else(|| ProviderError::Fetch("Could not find downloaded file!".to_string()))
        }
    }
}
