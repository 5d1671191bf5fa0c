use std::path::Path;

use pyo3::prelude::*;
use pyo3::types::PyDict;

/// Build the options dict shared by metadata and download calls.
fn base_options<'py>(py: Python<'py>, cookies_path: Option<&Path>) -> PyResult<Bound<'py, PyDict>> {
    let opts = PyDict::new(py);
    opts.set_item("quiet", true)?;
    opts.set_item("no_warnings", true)?;
    opts.set_item("noplaylist", true)?;
    opts.set_item("socket_timeout", 30)?;

    if let Some(cp) = cookies_path {
        if cp.exists() {
            opts.set_item("cookiefile", cp.to_string_lossy().to_string())?;
        }
    }
    Ok(opts)
}

/// Run `YoutubeDL(opts).extract_info(url, download=...)` and return the
/// sanitized info dict as a JSON string.
fn run_extract_info(
    py: Python<'_>,
    url: &str,
    opts: Bound<'_, PyDict>,
    download: bool,
) -> Result<String, String> {
    let yt_dlp = py
        .import("yt_dlp")
        .map_err(|e| format!("Failed to import yt_dlp: {e}"))?;

    let ydl = yt_dlp
        .getattr("YoutubeDL")
        .map_err(|e| format!("Failed to get YoutubeDL: {e}"))?
        .call1((opts,))
        .map_err(|e| format!("Failed to create YoutubeDL: {e}"))?;

    let kwargs = PyDict::new(py);
    kwargs
        .set_item("download", download)
        .map_err(|e| e.to_string())?;

    let result = ydl
        .call_method("extract_info", (url,), Some(&kwargs))
        .and_then(|info| ydl.call_method1("sanitize_info", (info,)))
        .map_err(|e| e.to_string());

    // Release file descriptors before inspecting the result.
    let _ = ydl.call_method0("close");
    let info = result?;

    py.import("json")
        .map_err(|e| format!("Failed to import json: {e}"))?
        .call_method1("dumps", (info,))
        .map_err(|e| format!("Failed to serialize: {e}"))?
        .extract::<String>()
        .map_err(|e| format!("Failed to extract string: {e}"))
}

/// Metadata-only extraction. Blocking: call from `spawn_blocking`.
pub fn extract_info(url: &str, cookies_path: Option<&Path>) -> Result<String, String> {
    Python::with_gil(|py| {
        let opts = base_options(py, cookies_path).map_err(|e| e.to_string())?;
        opts.set_item("skip_download", true)
            .map_err(|e| e.to_string())?;
        run_extract_info(py, url, opts, false)
    })
}

/// Download `format_id` into `work_dir` as `<title>.<ext>`, the title capped
/// at 180 bytes.
/// Blocking: call from `spawn_blocking`.
pub fn download(
    url: &str,
    format_id: &str,
    work_dir: &Path,
    cookies_path: Option<&Path>,
) -> Result<String, String> {
    let template = work_dir
        .join("%(title).180B.%(ext)s")
        .to_string_lossy()
        .to_string();

    Python::with_gil(|py| {
        let opts = base_options(py, cookies_path).map_err(|e| e.to_string())?;
        opts.set_item("format", format_id)
            .map_err(|e| e.to_string())?;
        opts.set_item("outtmpl", template)
            .map_err(|e| e.to_string())?;
        run_extract_info(py, url, opts, true)
    })
}
