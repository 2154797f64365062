//! Utility functions for common operations.

use crate::error::TranslationError;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// File extensions treated as content documents.
const DOCUMENT_EXTENSIONS: &[&str] = &["xhtml", "html", "htm"];

/// Writes `contents` next to `path` and renames it into place.
///
/// A crash mid-write leaves the previous file intact.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Expands files and directories into the list of content documents.
///
/// Directories are walked recursively; results are sorted so runs are
/// reproducible. Explicit file arguments are kept whatever their extension.
pub fn collect_documents(inputs: &[PathBuf]) -> std::io::Result<Vec<PathBuf>> {
    let mut documents = Vec::new();

    for input in inputs {
        if input.is_file() {
            documents.push(input.clone());
            continue;
        }
        if !input.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such file or directory: {}", input.display()),
            ));
        }

        for entry in WalkDir::new(input).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::other)?;
            if entry.file_type().is_file() && is_content_document(entry.path()) {
                documents.push(entry.into_path());
            }
        }
    }

    documents.dedup();
    Ok(documents)
}

fn is_content_document(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            DOCUMENT_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

/// Returns at most `max_chars` characters of `text`, on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

/// Lower-case hex SHA-256 of `input`.
pub fn sha256_hex(input: &str) -> String {
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

/// Checks if an HTTP response is successful, and if not, returns a detailed error.
///
/// Throttling statuses (429, and 529 "overloaded") become
/// [`TranslationError::RateLimited`] so callers can back off and retry.
pub async fn check_response_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, TranslationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let message = format!("HTTP {}: {}", status, text);
    if is_rate_limit_status(status.as_u16()) {
        Err(TranslationError::RateLimited(message))
    } else {
        Err(TranslationError::ApiError(message))
    }
}

/// Statuses a provider uses to signal throttling.
pub fn is_rate_limit_status(status: u16) -> bool {
    matches!(status, 429 | 529)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 2), "he");
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_rate_limit_statuses() {
        assert!(is_rate_limit_status(429));
        assert!(is_rate_limit_status(529));
        assert!(!is_rate_limit_status(500));
        assert!(!is_rate_limit_status(401));
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("chapter.xhtml");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_collect_documents_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        let text = dir.path().join("Text");
        std::fs::create_dir_all(&text).unwrap();
        std::fs::write(text.join("b.xhtml"), "<p/>").unwrap();
        std::fs::write(text.join("a.html"), "<p/>").unwrap();
        std::fs::write(text.join("style.css"), "p{}").unwrap();
        std::fs::write(dir.path().join("content.opf"), "<package/>").unwrap();

        let found = collect_documents(&[dir.path().to_path_buf()]).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.html", "b.xhtml"]);
    }

    #[test]
    fn test_collect_documents_missing_path() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing");
        assert!(collect_documents(&[missing]).is_err());
    }
}
