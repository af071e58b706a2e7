//! File-extension based content typing.

/// Lowercased extension of a file name or path, without the dot.
pub fn extension_of(name: &str) -> Option<String> {
    let file = name.rsplit('/').next().unwrap_or(name);
    let (stem, ext) = file.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Content type for a file extension.
pub fn content_type_for(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "wmv" => "video/x-ms-wmv",
        "mpg" | "mpeg" => "video/mpeg",
        "ogv" => "video/ogg",
        "ts" | "mts" | "m2ts" => "video/mp2t",
        "3gp" => "video/3gpp",
        "mp3" => "audio/mpeg",
        "m4a" | "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" | "oga" => "audio/ogg",
        "flac" => "audio/flac",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "xml" | "xlf" => "text/xml; charset=utf-8",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Audio and video files are large and seekable; a full cache miss on them is
/// answered with "accepted, retry shortly" instead of not-found.
pub fn is_streaming_media(ext: &str) -> bool {
    let content_type = content_type_for(ext);
    content_type.starts_with("video/") || content_type.starts_with("audio/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_is_taken_from_the_last_path_segment() {
        assert_eq!(extension_of("42.MP4").as_deref(), Some("mp4"));
        assert_eq!(extension_of("a.b/c").as_deref(), None);
        assert_eq!(extension_of("/cache/media/7.webm").as_deref(), Some("webm"));
        assert_eq!(extension_of(".hidden"), None);
    }

    #[test]
    fn only_audio_and_video_are_streaming_media() {
        assert!(is_streaming_media("mp4"));
        assert!(is_streaming_media("mp3"));
        assert!(!is_streaming_media("png"));
        assert!(!is_streaming_media("js"));
        assert!(!is_streaming_media("unknown"));
    }
}
