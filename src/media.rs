use std::io::Read;

use image::ImageFormat;
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Media {
    Youtube { id: String },
    DirectVideo { url: String },
    Image { url: String },
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Image,
    Video,
    Other,
}

pub fn classify_link(raw: &str) -> Media {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Media::Plain;
    }
    if let Some(id) = youtube_id(trimmed) {
        return Media::Youtube { id };
    }
    if is_direct_video_url(trimmed) {
        return Media::DirectVideo {
            url: trimmed.to_string(),
        };
    }
    Media::Plain
}

/// Accepts a bare 11-character id, a short-host URL carrying the id as its
/// path, or a full-host URL with an 11-character `v` parameter.
pub fn youtube_id(input: &str) -> Option<String> {
    static ID_ONLY: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]{11}$").expect("valid youtube id regex"));

    if ID_ONLY.is_match(input) {
        return Some(input.to_string());
    }

    let parsed = Url::parse(input).ok()?;
    let host = parsed.host_str()?;
    if host.contains("youtu.be") {
        let id = parsed.path().trim_start_matches('/');
        if id.is_empty() {
            return None;
        }
        return Some(id.to_string());
    }
    if host.contains("youtube.com") {
        if let Some((_, v)) = parsed.query_pairs().find(|(key, _)| key == "v") {
            if v.chars().count() == 11 {
                return Some(v.into_owned());
            }
        }
    }
    None
}

pub fn is_direct_video_url(raw: &str) -> bool {
    static VIDEO_URL: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^https?://.+\.(mp4|webm)(\?.*)?$").expect("valid video url regex")
    });
    VIDEO_URL.is_match(raw)
}

pub fn embed_url(id: &str) -> String {
    format!("https://www.youtube.com/embed/{}", id)
}

/// Render treatment for an uploaded file, from its declared MIME type.
pub fn upload_kind(mime: &str) -> UploadKind {
    if mime.starts_with("image/") {
        UploadKind::Image
    } else if mime.starts_with("video/") {
        UploadKind::Video
    } else {
        UploadKind::Other
    }
}

/// Sniffs the payload when the uploader declared no usable content type.
pub fn detect_mime(bytes: &[u8]) -> String {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => "image/jpeg".into(),
        Ok(ImageFormat::Png) => "image/png".into(),
        Ok(ImageFormat::Gif) => "image/gif".into(),
        Ok(ImageFormat::WebP) => "image/webp".into(),
        _ => {
            let mut buffer = [0u8; 512];
            let mut cursor = std::io::Cursor::new(bytes);
            let read = cursor.read(&mut buffer).unwrap_or(0);
            tree_magic_mini::from_u8(&buffer[..read]).to_string()
        }
    }
}
