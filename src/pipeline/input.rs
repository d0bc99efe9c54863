//! Input resolution: read a user-supplied path or URL into memory.
//!
//! Uploads are small (5 MiB cap) and the asset store takes bytes, so the
//! whole document is held in memory. The MIME type is sniffed from magic
//! bytes, never taken from the extension or `Content-Type`.

use crate::error::InvoiceError;
use image::ImageFormat;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// MIME type reported for content that is none of the accepted formats.
pub const UNKNOWN_MIME: &str = "application/octet-stream";

/// A document ready for upload.
#[derive(Debug, Clone)]
pub struct InputDocument {
    pub filename: String,
    pub mime: &'static str,
    pub bytes: Vec<u8>,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Identify JPEG, PNG, GIF and PDF content by magic bytes.
pub fn sniff_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"%PDF") {
        return "application/pdf";
    }
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => "image/jpeg",
        Ok(ImageFormat::Png) => "image/png",
        Ok(ImageFormat::Gif) => "image/gif",
        _ => UNKNOWN_MIME,
    }
}

/// Resolve a local path or HTTP(S) URL to an [`InputDocument`].
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<InputDocument, InvoiceError> {
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        read_local(Path::new(input)).await
    }
}

async fn read_local(path: &Path) -> Result<InputDocument, InvoiceError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => InvoiceError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => InvoiceError::FileNotFound {
            path: path.to_path_buf(),
        },
    })?;

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    let mime = sniff_mime(&bytes);
    debug!("Resolved local file {} ({}, {} bytes)", path.display(), mime, bytes.len());

    Ok(InputDocument {
        filename,
        mime,
        bytes,
    })
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<InputDocument, InvoiceError> {
    info!("Downloading document from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| InvoiceError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            InvoiceError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            InvoiceError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(InvoiceError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| InvoiceError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?
        .to_vec();

    let mime = sniff_mime(&bytes);
    let filename = filename_from_url(url, mime);
    info!("Downloaded {} ({}, {} bytes)", filename, mime, bytes.len());

    Ok(InputDocument {
        filename,
        mime,
        bytes,
    })
}

/// Last URL path segment if it looks like a filename, else `download.{ext}`.
fn filename_from_url(url: &str, mime: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }

    let ext = match mime {
        "application/pdf" => "pdf",
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        _ => "bin",
    };
    PathBuf::from("download")
        .with_extension(ext)
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/receipt.jpg"));
        assert!(is_url("http://example.com/receipt.jpg"));
        assert!(!is_url("/tmp/receipt.jpg"));
        assert!(!is_url(""));
    }

    #[test]
    fn sniffs_accepted_formats() {
        assert_eq!(sniff_mime(b"%PDF-1.7\n"), "application/pdf");
        assert_eq!(sniff_mime(b"\x89PNG\r\n\x1a\n0000"), "image/png");
        assert_eq!(sniff_mime(b"\xff\xd8\xff\xe0000000"), "image/jpeg");
        assert_eq!(sniff_mime(b"GIF89a000000"), "image/gif");
        assert_eq!(sniff_mime(b"hello world"), UNKNOWN_MIME);
    }

    #[test]
    fn filename_fallbacks() {
        assert_eq!(
            filename_from_url("https://x.test/scans/bill.png", "image/png"),
            "bill.png"
        );
        assert_eq!(
            filename_from_url("https://x.test/scans/42", "application/pdf"),
            "download.pdf"
        );
    }

    #[tokio::test]
    async fn reads_local_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("receipt.gif");
        tokio::fs::write(&path, b"GIF89a000000").await.unwrap();

        let doc = resolve_input(path.to_str().unwrap(), 5).await.unwrap();
        assert_eq!(doc.filename, "receipt.gif");
        assert_eq!(doc.mime, "image/gif");
        assert_eq!(doc.bytes.len(), 12);
    }

    #[tokio::test]
    async fn missing_local_file() {
        let err = resolve_input("/definitely/not/here.png", 5).await.unwrap_err();
        assert!(matches!(err, InvoiceError::FileNotFound { .. }));
    }
}
