use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use super::{MediaProvider, ResolvedMedia};
use crate::error::{ProviderError, Result};
use crate::media::{container_for, AudioRule, MediaStream, StreamKind};
use crate::transfer;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamsResponse {
    title: Option<String>,
    thumbnail_url: Option<String>,
    #[serde(default)]
    video_streams: Vec<PipedStream>,
    #[serde(default)]
    audio_streams: Vec<PipedStream>,
    error: Option<String>,
    message: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipedStream {
    url: Option<String>,
    itag: Option<Value>,
    mime_type: Option<String>,
    quality: Option<String>,
    fps: Option<f64>,
    content_length: Option<i64>,
}

impl PipedStream {
    /// Itags arrive as numbers; format ids are compared as strings.
    fn id(&self) -> Option<String> {
        match self.itag.as_ref()? {
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }

    fn into_stream(self, kind: StreamKind, rule: AudioRule) -> Option<MediaStream> {
        let id = self.id()?;
        let mime = self.mime_type.as_deref().unwrap_or("");
        let resolution_label = match kind {
            StreamKind::Audio => "Audio".to_string(),
            StreamKind::Video => {
                let quality = self
                    .quality
                    .as_deref()
                    .filter(|q| !q.trim().is_empty())
                    .unwrap_or("N/A");
                match self.fps {
                    Some(fps) if fps > 0.0 => format!("{quality} ({fps}fps)"),
                    _ => quality.to_string(),
                }
            }
        };

        Some(MediaStream {
            id,
            kind,
            extension: container_for(kind, mime, rule).to_string(),
            resolution_label,
            size_bytes: self.content_length.filter(|n| *n > 0).unwrap_or(0) as u64,
            direct_url: self.url,
        })
    }
}

/// Remote metadata backend speaking the Piped `/streams/{id}` API.
pub struct PipedProvider {
    base_url: String,
    client: reqwest::Client,
    audio_rule: AudioRule,
}

impl PipedProvider {
    pub fn new(base_url: String, client: reqwest::Client, audio_rule: AudioRule) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            audio_rule,
        }
    }

    fn streams_url(&self, video_id: &str) -> String {
        format!("{}/streams/{video_id}", self.base_url)
    }
}

#[async_trait]
impl MediaProvider for PipedProvider {
    fn name(&self) -> &'static str {
        "piped"
    }

    async fn resolve(&self, url: &str) -> Result<ResolvedMedia> {
        let id = video_id(url)?;
        let api_url = self.streams_url(&id);
        debug!("Querying Piped: {api_url}");

        let response = self.client.get(&api_url).send().await?;
        let status = response.status();
        let body = response.text().await?;

        let data: StreamsResponse = serde_json::from_str(&body).map_err(|e| {
            warn!("Unparsable Piped payload for {id} (HTTP {status}): {e}");
            ProviderError::Extraction(format!("Malformed response from Piped (HTTP {status}): {e}"))
        })?;

        let Some(title) = data.title else {
            let msg = data
                .message
                .or(data.error)
                .unwrap_or_else(|| "Could not fetch video data".to_string());
            return Err(ProviderError::Extraction(msg));
        };

        let rule = self.audio_rule;
        let streams = data
            .video_streams
            .into_iter()
            .filter_map(|s| s.into_stream(StreamKind::Video, rule))
            .chain(
                data.audio_streams
                    .into_iter()
                    .filter_map(|s| s.into_stream(StreamKind::Audio, rule)),
            )
            .collect();

        Ok(ResolvedMedia {
            title,
            thumbnail_url: data.thumbnail_url,
            streams,
        })
    }

    async fn fetch(
        &self,
        _url: &str,
        stream: &MediaStream,
        work_dir: &Path,
        file_name: &str,
    ) -> Result<PathBuf> {
        let Some(direct_url) = stream.direct_url.as_deref() else {
            return Err(ProviderError::Fetch(format!(
                "Stream {} has no download URL",
                stream.id
            )));
        };
        let dest = work_dir.join(file_name);
        transfer::download_to_file(&self.client, direct_url, &dest).await?;
        Ok(dest)
    }
}

/// Derive the video id Piped expects from a watch URL, short link or bare id.
pub fn video_id(input: &str) -> Result<String> {
    let input = input.trim();
    let parsed = Url::parse(input)
        .ok()
        .filter(|u| u.has_host())
        .or_else(|| {
            if input.contains('/') || input.contains("v=") {
                Url::parse(&format!("https://{input}")).ok()
            } else {
                None
            }
        });

    let candidate = match parsed {
        Some(url) => id_from_url(&url),
        None => Some(input.to_string()),
    };

    candidate
        .filter(|id| is_plain_id(id))
        .ok_or_else(|| {
            ProviderError::Extraction(format!("Could not derive a video id from URL: {input}"))
        })
}

fn id_from_url(url: &Url) -> Option<String> {
    if let Some((_, v)) = url.query_pairs().find(|(k, _)| k == "v") {
        return Some(v.into_owned());
    }

    let host = url.host_str().unwrap_or("");
    let host = host.strip_prefix("www.").unwrap_or(host);
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect())
        .unwrap_or_default();

    match (host, segments.as_slice()) {
        ("youtu.be", [id, ..]) => Some((*id).to_string()),
        (_, ["shorts" | "embed" | "live" | "v", id, ..]) => Some((*id).to_string()),
        _ => None,
    }
}

fn is_plain_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 64
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
