//! Extraction backends.
//!
//! A backend turns a video URL into a title, thumbnail and stream list, and
//! knows how to move the bytes of one of those streams into a work directory.

pub mod piped;
#[cfg(feature = "ytdlp")]
mod python;
pub mod ytdlp;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{BackendKind, Settings};
use crate::error::Result;
use crate::media::{MediaInfo, MediaStream};

/// Backend output for one URL, including how to fetch each stream.
#[derive(Debug, Clone)]
pub struct ResolvedMedia {
    pub title: String,
    pub thumbnail_url: Option<String>,
    pub streams: Vec<MediaStream>,
}

impl ResolvedMedia {
    /// First stream whose id equals `format_id`.
    pub fn find_stream(&self, format_id: &str) -> Option<&MediaStream> {
        self.streams.iter().find(|s| s.id == format_id)
    }

    pub fn into_media_info(self) -> MediaInfo {
        MediaInfo {
            formats: self.streams.iter().map(MediaStream::descriptor).collect(),
            title: self.title,
            thumbnail_url: self.thumbnail_url,
        }
    }
}

#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// Short backend name for logs and `/health`.
    fn name(&self) -> &'static str;

    /// Query the backend for the current stream list of `url`.
    async fn resolve(&self, url: &str) -> Result<ResolvedMedia>;

    /// Place the bytes of `stream` inside `work_dir` and return the final path.
    ///
    /// `file_name` is the sanitized name the caller wants; backends that name
    /// their own output may ignore it.
    async fn fetch(
        &self,
        url: &str,
        stream: &MediaStream,
        work_dir: &Path,
        file_name: &str,
    ) -> Result<PathBuf>;
}

/// Build the backend selected by `settings.backend`.
pub fn build_provider(
    settings: &Settings,
    http_client: reqwest::Client,
) -> std::result::Result<Arc<dyn MediaProvider>, String> {
    match settings.backend {
        BackendKind::Piped => Ok(Arc::new(piped::PipedProvider::new(
            settings.piped_api.clone(),
            http_client,
            settings.audio_rule,
        ))),
        #[cfg(feature = "ytdlp")]
        BackendKind::Ytdlp => Ok(Arc::new(ytdlp::YtdlpProvider::new(
            settings.cookies_path.clone(),
            settings.ytdlp_timeout,
        ))),
        #[cfg(not(feature = "ytdlp"))]
        BackendKind::Ytdlp => {
            Err("yt-dlp backend requested but this build lacks the `ytdlp` feature".to_string())
        }
    }
}
