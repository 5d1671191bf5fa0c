use std::str::FromStr;
use std::sync::LazyLock;

use regex_lite::Regex;
use serde::Serialize;

/// Characters that are illegal in filenames on at least one common filesystem.
static ILLEGAL_FILENAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[\\/*?:"<>|\x00-\x1F]"#).unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
}

/// One downloadable format as returned by `GET /formats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatDescriptor {
    pub id: String,
    #[serde(rename = "ext")]
    pub extension: String,
    #[serde(rename = "resolution")]
    pub resolution_label: String,
    #[serde(rename = "size")]
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaInfo {
    pub title: String,
    #[serde(rename = "thumbnail")]
    pub thumbnail_url: Option<String>,
    pub formats: Vec<FormatDescriptor>,
}

/// A stream as reported by a backend, with enough detail to fetch it later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
    pub kind: StreamKind,
    pub extension: String,
    pub resolution_label: String,
    pub size_bytes: u64,
    /// Origin URL for backends that hand out direct links. `None` when the
    /// backend performs the transfer itself.
    pub direct_url: Option<String>,
}

impl MediaStream {
    pub fn descriptor(&self) -> FormatDescriptor {
        FormatDescriptor {
            id: self.id.clone(),
            extension: self.extension.clone(),
            resolution_label: self.resolution_label.clone(),
            size_bytes: self.size_bytes,
        }
    }
}

/// How audio streams are mapped to a container extension.
///
/// Backends disagree on this, so it is configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioRule {
    /// `audio/mp3` or `audio/mpeg` is mp3, everything else is m4a.
    Mp3OrM4a,
    /// Use the MIME subtype (mpeg, mp4, webm, wav), falling back to m4a.
    Subtype,
}

impl FromStr for AudioRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp3-or-m4a" | "legacy" => Ok(Self::Mp3OrM4a),
            "subtype" => Ok(Self::Subtype),
            other => Err(format!("unknown audio container rule: {other}")),
        }
    }
}

/// Container extension for a stream of `kind` declaring `mime_type`.
pub fn container_for(kind: StreamKind, mime_type: &str, rule: AudioRule) -> &'static str {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    let subtype = essence.split_once('/').map(|(_, s)| s).unwrap_or("");

    match kind {
        StreamKind::Video => {
            if subtype == "webm" {
                "webm"
            } else {
                "mp4"
            }
        }
        StreamKind::Audio => match rule {
            AudioRule::Mp3OrM4a => {
                if matches!(subtype, "mp3" | "mpeg") {
                    "mp3"
                } else {
                    "m4a"
                }
            }
            AudioRule::Subtype => match subtype {
                "mp3" | "mpeg" => "mp3",
                "webm" => "webm",
                "wav" | "wave" | "x-wav" => "wav",
                _ => "m4a",
            },
        },
    }
}

/// MIME type served for a file with the given extension.
pub fn mime_for_extension(ext: &str) -> &'static str {
    match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "wav" => "audio/wav",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

/// Whether `ext` has an entry in the MIME table.
pub fn is_known_extension(ext: &str) -> bool {
    mime_for_extension(ext) != "application/octet-stream"
}

/// Strip characters that are illegal in common filesystems.
pub fn sanitize_filename(name: &str) -> String {
    ILLEGAL_FILENAME_CHARS.replace_all(name, "").into_owned()
}

/// Byte cap for names written to disk, well under the usual 255-byte NAME_MAX.
pub const MAX_FILE_NAME_BYTES: usize = 200;

/// Sanitized `<title>.<ext>`, using `download` when the title has nothing left.
///
/// The title is cut on a char boundary so the whole name fits in
/// [`MAX_FILE_NAME_BYTES`].
pub fn file_name_for(title: &str, ext: &str) -> String {
    let ext = sanitize_filename(ext);
    let stem = sanitize_filename(title);
    let budget = MAX_FILE_NAME_BYTES.saturating_sub(ext.len() + 1);
    let stem = truncate_to_bytes(stem.trim(), budget).trim_end();
    let stem = if stem.is_empty() { "download" } else { stem };
    format!("{stem}.{ext}")
}

fn truncate_to_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// RFC 5987 attachment header value.
pub fn content_disposition(file_name: &str) -> String {
    format!(
        "attachment; filename*=UTF-8''{}",
        urlencoding::encode(file_name)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_removes_every_illegal_char() {
        let name = sanitize_filename(r#"a/b*c?d\e:f"g<h>i|j"#);
        assert_eq!(name, "abcdefghij");
        for c in ['\\', '/', '*', '?', ':', '"', '<', '>', '|'] {
            assert!(!name.contains(c));
        }
    }

    #[test]
    fn sanitize_keeps_unicode_and_spaces() {
        assert_eq!(sanitize_filename("Café - live 2024"), "Café - live 2024");
    }

    #[test]
    fn file_name_for_falls_back_when_title_is_all_illegal() {
        assert_eq!(file_name_for("a/b*c?d", "mp4"), "abcd.mp4");
        assert_eq!(file_name_for("???", "mp3"), "download.mp3");
        assert_eq!(file_name_for("   ", "m4a"), "download.m4a");
    }

    #[test]
    fn file_name_for_caps_long_titles_on_char_boundaries() {
        let cjk = "日".repeat(100);
        let name = file_name_for(&cjk, "mp4");
        assert!(name.len() <= MAX_FILE_NAME_BYTES);
        assert!(name.ends_with(".mp4"));
        assert!(name.trim_end_matches(".mp4").chars().all(|c| c == '日'));
        assert_eq!(name.trim_end_matches(".mp4").chars().count(), 65);

        let ascii = "x".repeat(400);
        assert_eq!(file_name_for(&ascii, "m4a").len(), MAX_FILE_NAME_BYTES);

        let short = file_name_for("日本語", "mp3");
        assert_eq!(short, "日本語.mp3");
    }

    #[test]
    fn mime_table() {
        assert_eq!(mime_for_extension("mp4"), "video/mp4");
        assert_eq!(mime_for_extension(".WEBM"), "video/webm");
        assert_eq!(mime_for_extension("mp3"), "audio/mpeg");
        assert_eq!(mime_for_extension("m4a"), "audio/mp4");
        assert_eq!(mime_for_extension("wav"), "audio/wav");
        assert_eq!(mime_for_extension("webp"), "image/webp");
        assert_eq!(mime_for_extension("mkv"), "application/octet-stream");
        assert!(!is_known_extension("flv"));
    }

    #[test]
    fn video_containers() {
        let rule = AudioRule::Mp3OrM4a;
        assert_eq!(
            container_for(StreamKind::Video, "video/mp4; codecs=\"avc1\"", rule),
            "mp4"
        );
        assert_eq!(container_for(StreamKind::Video, "video/webm", rule), "webm");
        assert_eq!(container_for(StreamKind::Video, "", rule), "mp4");
    }

    #[test]
    fn audio_containers_depend_on_rule() {
        let legacy = AudioRule::Mp3OrM4a;
        assert_eq!(container_for(StreamKind::Audio, "audio/mp3", legacy), "mp3");
        assert_eq!(container_for(StreamKind::Audio, "audio/mp4", legacy), "m4a");
        assert_eq!(container_for(StreamKind::Audio, "audio/webm", legacy), "m4a");

        let subtype = AudioRule::Subtype;
        assert_eq!(container_for(StreamKind::Audio, "audio/mpeg", subtype), "mp3");
        assert_eq!(container_for(StreamKind::Audio, "audio/webm", subtype), "webm");
        assert_eq!(container_for(StreamKind::Audio, "audio/x-wav", subtype), "wav");
        assert_eq!(container_for(StreamKind::Audio, "audio/ogg", subtype), "m4a");
    }

    #[test]
    fn audio_rule_parses() {
        assert_eq!("subtype".parse::<AudioRule>(), Ok(AudioRule::Subtype));
        assert_eq!("MP3-OR-M4A".parse::<AudioRule>(), Ok(AudioRule::Mp3OrM4a));
        assert!("flac".parse::<AudioRule>().is_err());
    }

    #[test]
    fn content_disposition_percent_encodes() {
        assert_eq!(
            content_disposition("My Video.mp4"),
            "attachment; filename*=UTF-8''My%20Video.mp4"
        );
        assert_eq!(
            content_disposition("é.mp3"),
            "attachment; filename*=UTF-8''%C3%A9.mp3"
        );
    }

    #[test]
    fn descriptor_serializes_with_wire_names() {
        let stream = MediaStream {
            id: "18".into(),
            kind: StreamKind::Video,
            extension: "mp4".into(),
            resolution_label: "360p (30fps)".into(),
            size_bytes: 1024,
            direct_url: Some("https://cdn/x".into()),
        };
        let json = serde_json::to_value(stream.descriptor()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": "18", "ext": "mp4", "resolution": "360p (30fps)", "size": 1024})
        );
    }
}
