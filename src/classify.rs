//! Format classification.
//!
//! [`classify`] is a pure function of `(content_type, key)`: the explicit
//! content-type wins, then the key's extension, then `Unsupported`.
//!
//! | Class | Content types | Extensions |
//! |-------|---------------|------------|
//! | text-like | `text/*`, `application/json`, `application/xml`, `application/yaml`, ... | `txt md csv json xml yaml yml html htm rst log tsv` |
//! | image-like | `image/*` | `png jpg jpeg gif webp tiff tif bmp` |
//! | pdf-like | `application/pdf` | `pdf` |

use crate::models::{ContentClass, ExtractionStrategy};

const TEXT_APPLICATION_TYPES: &[&str] = &[
    "application/json",
    "application/xml",
    "application/yaml",
    "application/x-yaml",
    "application/csv",
    "application/javascript",
    "application/x-ndjson",
];

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "csv", "tsv", "json", "ndjson", "xml", "yaml", "yml", "html", "htm",
    "rst", "log",
];

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "tiff", "tif", "bmp"];

/// Choose the extraction category for an object.
pub fn classify(content_type: &str, key: &str) -> ContentClass {
    classify_content_type(content_type)
        .or_else(|| classify_extension(key))
        .unwrap_or(ContentClass::Unsupported)
}

/// The strategy a class is extracted with. `Unsupported` is attempted with
/// direct decode as a last resort.
pub fn strategy_for(class: ContentClass) -> ExtractionStrategy {
    match class {
        ContentClass::ImageLike | ContentClass::PdfLike => ExtractionStrategy::Vision,
        ContentClass::TextLike | ContentClass::Unsupported => ExtractionStrategy::Direct,
    }
}

fn classify_content_type(content_type: &str) -> Option<ContentClass> {
    let essence = essence(content_type);
    if essence.is_empty() {
        return None;
    }
    if essence.starts_with("text/") || TEXT_APPLICATION_TYPES.contains(&essence.as_str()) {
        return Some(ContentClass::TextLike);
    }
    if essence.ends_with("+json") || essence.ends_with("+xml") {
        return Some(ContentClass::TextLike);
    }
    if essence.starts_with("image/") {
        return Some(ContentClass::ImageLike);
    }
    if essence == "application/pdf" {
        return Some(ContentClass::PdfLike);
    }
    None
}

fn classify_extension(key: &str) -> Option<ContentClass> {
    let ext = extension(key)?;
    if TEXT_EXTENSIONS.contains(&ext.as_str()) {
        Some(ContentClass::TextLike)
    } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        Some(ContentClass::ImageLike)
    } else if ext == "pdf" {
        Some(ContentClass::PdfLike)
    } else {
        None
    }
}

/// Lowercased MIME type without parameters (`"Text/Plain; charset=utf-8"` → `"text/plain"`).
pub fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Lowercased extension of the last path segment of `key`.
pub fn extension(key: &str) -> Option<String> {
    let name = key.rsplit('/').next().unwrap_or(key);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Guess a MIME type from the key's extension, for objects stored without one.
pub fn guess_content_type(key: &str) -> Option<&'static str> {
    let mime = match extension(key)?.as_str() {
        "txt" | "log" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "csv" => "text/csv",
        "tsv" => "text/tab-separated-values",
        "json" => "application/json",
        "ndjson" => "application/x-ndjson",
        "xml" => "application/xml",
        "yaml" | "yml" => "application/yaml",
        "html" | "htm" => "text/html",
        "rst" => "text/x-rst",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "tiff" | "tif" => "image/tiff",
        "bmp" => "image/bmp",
        _ => return None,
    };
    Some(mime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_takes_precedence_over_extension() {
        assert_eq!(classify("application/pdf", "scan.txt"), ContentClass::PdfLike);
        assert_eq!(classify("text/plain", "photo.png"), ContentClass::TextLike);
        assert_eq!(classify("image/png", "notes.md"), ContentClass::ImageLike);
    }

    #[test]
    fn text_like_content_types() {
        assert_eq!(classify("text/csv", "x"), ContentClass::TextLike);
        assert_eq!(classify("application/json", "x"), ContentClass::TextLike);
        assert_eq!(
            classify("Text/Plain; charset=UTF-8", "x"),
            ContentClass::TextLike
        );
        assert_eq!(classify("application/ld+json", "x"), ContentClass::TextLike);
    }

    #[test]
    fn falls_back_to_extension() {
        assert_eq!(classify("", "report.PDF"), ContentClass::PdfLike);
        assert_eq!(
            classify("application/octet-stream", "a/b/scan.jpeg"),
            ContentClass::ImageLike
        );
        assert_eq!(classify("binary/octet-stream", "data.csv"), ContentClass::TextLike);
    }

    #[test]
    fn unknown_is_unsupported() {
        assert_eq!(
            classify("application/octet-stream", "archive.bin"),
            ContentClass::Unsupported
        );
        assert_eq!(classify("", "README"), ContentClass::Unsupported);
        assert_eq!(classify("", ".bashrc"), ContentClass::Unsupported);
    }

    #[test]
    fn classification_is_deterministic() {
        let inputs = [
            ("application/pdf", "a.pdf"),
            ("", "b.png"),
            ("text/markdown", "c"),
            ("application/zip", "d.zip"),
        ];
        for (ct, key) in inputs {
            let first = classify(ct, key);
            for _ in 0..10 {
                assert_eq!(classify(ct, key), first);
            }
        }
    }

    #[test]
    fn strategy_selection() {
        assert_eq!(strategy_for(ContentClass::PdfLike), ExtractionStrategy::Vision);
        assert_eq!(strategy_for(ContentClass::ImageLike), ExtractionStrategy::Vision);
        assert_eq!(strategy_for(ContentClass::TextLike), ExtractionStrategy::Direct);
        assert_eq!(strategy_for(ContentClass::Unsupported), ExtractionStrategy::Direct);
    }

    #[test]
    fn extension_uses_last_segment() {
        assert_eq!(extension("dir.v2/file"), None);
        assert_eq!(extension("dir/file.tar.GZ").as_deref(), Some("gz"));
        assert_eq!(guess_content_type("x/y.jpg"), Some("image/jpeg"));
        assert_eq!(guess_content_type("x/y.unknown"), None);
    }
}
