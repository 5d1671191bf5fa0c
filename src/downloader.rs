use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::cleanup::TempWorkspace;
use crate::config::Settings;
use crate::error::{ProviderError, Result};
use crate::media::{file_name_for, mime_for_extension, sanitize_filename};
use crate::provider::MediaProvider;

/// One `/download` request. Owns its work directory exclusively; dropping the
/// job at any point removes the directory.
#[derive(Debug)]
pub struct DownloadJob {
    pub url: String,
    pub format_id: String,
    workspace: TempWorkspace,
}

/// A finished transfer, still holding the work directory that contains it.
#[derive(Debug)]
pub struct CompletedDownload {
    pub file_path: PathBuf,
    pub mime_type: &'static str,
    pub display_filename: String,
    pub size_bytes: u64,
    pub workspace: TempWorkspace,
}

impl DownloadJob {
    /// Allocate a fresh work directory for this request.
    pub async fn start(settings: &Settings, url: &str, format_id: &str) -> Result<Self> {
        let workspace =
            TempWorkspace::create_async(settings.temp_dir.clone(), settings.temp_prefix.clone())
                .await?;
        Ok(Self {
            url: url.trim().to_string(),
            format_id: format_id.trim().to_string(),
            workspace,
        })
    }

    pub fn temp_directory_path(&self) -> &Path {
        self.workspace.path()
    }

    /// Re-resolve the URL, pick the requested format and transfer it.
    ///
    /// Stream metadata is never reused from an earlier listing: origin URLs
    /// carry expiring tokens.
    pub async fn run(self, provider: &dyn MediaProvider) -> Result<CompletedDownload> {
        let media = provider.resolve(&self.url).await?;

        let stream = media
            .find_stream(&self.format_id)
            .ok_or_else(|| ProviderError::FormatNotFound(self.format_id.clone()))?;

        let file_name = file_name_for(&media.title, &stream.extension);
        debug!(
            "Fetching {:?} stream {} into {}",
            stream.kind,
            stream.id,
            self.temp_directory_path().display()
        );
        let file_path = provider
            .fetch(&self.url, stream, self.workspace.path(), &file_name)
            .await?;

        if !file_path.starts_with(self.workspace.path()) {
            warn!(
                "Backend wrote {} outside work dir {}",
                file_path.display(),
                self.workspace.path().display()
            );
            return Err(ProviderError::Fetch(
                "Downloaded file landed outside the work directory".to_string(),
            ));
        }

        let size_bytes = tokio::fs::metadata(&file_path).await?.len();

        let display_filename = file_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(sanitize_filename)
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(file_name);
        let ext = Path::new(&display_filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        info!(
            "Downloaded format {} of {} ({size_bytes} bytes) as {display_filename}",
            self.format_id, self.url
        );

        Ok(CompletedDownload {
            mime_type: mime_for_extension(ext),
            file_path,
            display_filename,
            size_bytes,
            workspace: self.workspace,
        })
    }
}

/// Download `format_id` of `url` into a new work directory.
///
/// On error the directory is already gone when this returns.
pub async fn download(
    provider: &dyn MediaProvider,
    settings: &Settings,
    url: &str,
    format_id: &str,
) -> Result<CompletedDownload> {
    if url.trim().is_empty() {
        return Err(ProviderError::Extraction(
            "URL parameter is required".to_string(),
        ));
    }
    if format_id.trim().is_empty() {
        return Err(ProviderError::Extraction(
            "format_id parameter is required".to_string(),
        ));
    }

    DownloadJob::start(settings, url, format_id)
        .await?
        .run(provider)
        .await
}
