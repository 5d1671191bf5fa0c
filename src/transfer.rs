use std::path::Path;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::error::{ProviderError, Result};

/// Copy the body of `url` verbatim into a new file at `dest`.
/// Returns the number of bytes written.
pub async fn download_to_file(client: &reqwest::Client, url: &str, dest: &Path) -> Result<u64> {
    let response = client.get(url).send().await.map_err(|e| {
        error!("HTTP error fetching media: {e}");
        ProviderError::Fetch(format!("Media request failed: {e}"))
    })?;

    if !response.status().is_success() {
        error!(
            "Origin returned status {} for {}",
            response.status(),
            url.chars().take(80).collect::<String>()
        );
        return Err(ProviderError::Fetch(format!(
            "Origin returned status {}",
            response.status()
        )));
    }

    let mut file = tokio::fs::File::create(dest).await?;
    let mut written = 0u64;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            error!("Error streaming chunk: {e}");
            ProviderError::Fetch(format!("Transfer interrupted: {e}"))
        })?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    debug!("Wrote {written} bytes to {}", dest.display());
    Ok(written)
}
