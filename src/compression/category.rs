//! File-type classification for compression decisions

use serde::{Deserialize, Serialize};

/// Compression-relevant file category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileCategory {
    Text,
    Code,
    Xml,
    Json,
    Html,
    Image,
    CompressedImage,
    Pdf,
    Media,
    Archive,
    Binary,
}

const CODE_EXTENSIONS: &[&str] = &[
    "rs", "c", "h", "cpp", "hpp", "cc", "java", "kt", "go", "py", "rb", "js", "jsx", "ts", "tsx",
    "php", "cs", "swift", "sh", "pl", "lua", "sql", "css", "scss", "vue",
];

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "rst", "log", "csv", "tsv", "ini", "conf", "cfg", "toml", "yaml", "yml",
];

const COMPRESSED_IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "avif", "heic"];

const IMAGE_EXTENSIONS: &[&str] = &["bmp", "tiff", "tif", "raw", "psd", "ico"];

const MEDIA_EXTENSIONS: &[&str] = &[
    "mp3", "mp4", "m4a", "aac", "ogg", "opus", "flac", "avi", "mkv", "mov", "webm", "wmv",
];

const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "gz", "tgz", "bz2", "xz", "zst", "7z", "rar", "br"];

impl FileCategory {
    /// Classify from a MIME hint and/or a file name extension. The MIME hint
    /// wins when both are present.
    pub fn classify(mime: Option<&str>, name: &str) -> Self {
        if let Some(mime) = mime {
            if let Some(category) = Self::from_mime(mime) {
                return category;
            }
        }
        Self::from_extension(name)
    }

    fn from_mime(mime: &str) -> Option<Self> {
        let mime = mime.to_ascii_lowercase();
        let category = match mime.as_str() {
            "application/json" => FileCategory::Json,
            "text/html" => FileCategory::Html,
            "application/xml" | "text/xml" | "image/svg+xml" => FileCategory::Xml,
            "application/pdf" => FileCategory::Pdf,
            "image/jpeg" | "image/png" | "image/gif" | "image/webp" | "image/avif" => {
                FileCategory::CompressedImage
            }
            _ if mime.starts_with("text/") => FileCategory::Text,
            _ if mime.starts_with("image/") => FileCategory::Image,
            _ if mime.starts_with("audio/") || mime.starts_with("video/") => FileCategory::Media,
            "application/zip"
            | "application/gzip"
            | "application/x-tar"
            | "application/x-7z-compressed"
            | "application/x-rar-compressed"
            | "application/zstd" => FileCategory::Archive,
            _ => return None,
        };
        Some(category)
    }

    fn from_extension(name: &str) -> Self {
        let extension = name
            .rsplit('.')
            .next()
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();
        let ext = extension.as_str();

        if ext == "json" {
            FileCategory::Json
        } else if ext == "html" || ext == "htm" {
            FileCategory::Html
        } else if ext == "xml" || ext == "svg" {
            FileCategory::Xml
        } else if ext == "pdf" {
            FileCategory::Pdf
        } else if CODE_EXTENSIONS.contains(&ext) {
            FileCategory::Code
        } else if TEXT_EXTENSIONS.contains(&ext) {
            FileCategory::Text
        } else if COMPRESSED_IMAGE_EXTENSIONS.contains(&ext) {
            FileCategory::CompressedImage
        } else if IMAGE_EXTENSIONS.contains(&ext) {
            FileCategory::Image
        } else if MEDIA_EXTENSIONS.contains(&ext) {
            FileCategory::Media
        } else if ARCHIVE_EXTENSIONS.contains(&ext) {
            FileCategory::Archive
        } else {
            FileCategory::Binary
        }
    }

    /// Starting gzip level before size/network/device adjustments
    pub fn base_level(&self) -> f64 {
        match self {
            FileCategory::Text => 7.0,
            FileCategory::Code => 8.0,
            FileCategory::Xml => 8.0,
            FileCategory::Json => 7.0,
            FileCategory::Html => 7.0,
            FileCategory::Image => 6.0,
            FileCategory::CompressedImage => 1.0,
            FileCategory::Pdf => 3.0,
            FileCategory::Media => 3.0,
            FileCategory::Archive => 1.0,
            FileCategory::Binary => 4.0,
        }
    }

    /// Already-compressed payloads gain nothing from a second pass
    pub fn is_precompressed(&self) -> bool {
        matches!(
            self,
            FileCategory::CompressedImage | FileCategory::Media | FileCategory::Archive
        )
    }

    /// Categories that compress well enough to always try
    pub fn is_textual(&self) -> bool {
        matches!(
            self,
            FileCategory::Text
                | FileCategory::Code
                | FileCategory::Xml
                | FileCategory::Json
                | FileCategory::Html
        )
    }

    /// Fallback compressed/original ratio used before any history exists
    pub fn default_ratio(&self) -> f64 {
        match self {
            FileCategory::Text => 0.35,
            FileCategory::Code => 0.3,
            FileCategory::Xml => 0.25,
            FileCategory::Json => 0.3,
            FileCategory::Html => 0.3,
            FileCategory::Image => 0.7,
            FileCategory::CompressedImage => 0.99,
            FileCategory::Pdf => 0.85,
            FileCategory::Media => 0.98,
            FileCategory::Archive => 0.99,
            FileCategory::Binary => 0.8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_hint_wins_over_extension() {
        let category = FileCategory::classify(Some("application/json"), "export.bak");
        assert_eq!(category, FileCategory::Json);
    }

    #[test]
    fn extension_fallback() {
        assert_eq!(FileCategory::classify(None, "main.rs"), FileCategory::Code);
        assert_eq!(
            FileCategory::classify(None, "holiday.JPG"),
            FileCategory::CompressedImage
        );
        assert_eq!(
            FileCategory::classify(None, "backup.tar.gz"),
            FileCategory::Archive
        );
        assert_eq!(FileCategory::classify(None, "unknown"), FileCategory::Binary);
    }

    #[test]
    fn precompressed_detection() {
        assert!(FileCategory::Media.is_precompressed());
        assert!(FileCategory::Archive.is_precompressed());
        assert!(!FileCategory::Text.is_precompressed());
    }
}
