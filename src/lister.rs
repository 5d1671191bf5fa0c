use tracing::info;

use crate::error::{ProviderError, Result};
use crate::media::MediaInfo;
use crate::provider::MediaProvider;

/// Resolve `url` and describe every format the backend offers for it.
pub async fn list_formats(provider: &dyn MediaProvider, url: &str) -> Result<MediaInfo> {
    let url = url.trim();
    if url.is_empty() {
        return Err(ProviderError::Extraction(
            "URL parameter is required".to_string(),
        ));
    }

    let media = provider.resolve(url).await?;
    info!(
        "Listed {} formats for \"{}\" via {}",
        media.streams.len(),
        media.title,
        provider.name()
    );
    Ok(media.into_media_info())
}
