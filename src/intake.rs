use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::CoreError;

// Extraction budgets. Malformed or adversarial archives fail closed
// (corrupt flag / skipped entries) instead of hanging or filling the disk.
const MAX_ARCHIVE_ENTRIES: usize = 4096;
const MAX_ENTRY_BYTES: u64 = 64 * 1024 * 1024;
const MAX_TOTAL_BYTES: u64 = 512 * 1024 * 1024;

/// File category, decided once at classification time from the
/// extension and carried on the submission_files row. Consumers branch
/// on this instead of re-deriving it from the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Spreadsheet,
    Text,
    Pdf,
    Image,
    Document,
    Other,
}

impl FileKind {
    pub fn from_path(path: &Path) -> FileKind {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "xlsx" | "xlsm" | "xltx" | "xls" | "ods" => FileKind::Spreadsheet,
            "txt" | "md" | "csv" | "tsv" | "json" | "xml" | "html" | "py" | "r" | "sql"
            | "log" => FileKind::Text,
            "pdf" => FileKind::Pdf,
            "png" | "jpg" | "jpeg" | "gif" | "bmp" | "webp" => FileKind::Image,
            "docx" | "doc" | "rtf" | "odt" => FileKind::Document,
            _ => FileKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Spreadsheet => "spreadsheet",
            FileKind::Text => "text",
            FileKind::Pdf => "pdf",
            FileKind::Image => "image",
            FileKind::Document => "document",
            FileKind::Other => "other",
        }
    }
}

/// One extracted entry, ready to be persisted as a submission_files row.
#[derive(Debug)]
pub struct ExtractedFile {
    pub rel_path: String,
    pub cache_path: PathBuf,
    pub kind: FileKind,
    pub size_bytes: u64,
    pub content_hash: String,
    pub is_corrupt: bool,
    pub encoding: Option<&'static str>,
}

#[derive(Debug)]
pub struct Extraction {
    pub files: Vec<ExtractedFile>,
    /// Entries skipped by the budget caps, reported so intake can note
    /// the truncation instead of silently dropping content.
    pub skipped_entries: usize,
}

pub fn compute_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let count = file.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Extract an archive into `out_dir`, tolerating individual bad entries.
/// Fails only when the archive itself cannot be opened; a bad entry is
/// recorded with its corrupt flag set and extraction continues.
pub fn extract_archive(zip_path: &Path, out_dir: &Path) -> Result<Extraction, CoreError> {
    let file = File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| CoreError::ExtractionFailure(e.to_string()))?;

    std::fs::create_dir_all(out_dir)?;

    let mut files = Vec::new();
    let mut skipped_entries = 0usize;
    let mut total_bytes = 0u64;

    for i in 0..archive.len() {
        if i >= MAX_ARCHIVE_ENTRIES || total_bytes >= MAX_TOTAL_BYTES {
            skipped_entries += archive.len() - i;
            tracing::warn!(
                archive = %zip_path.display(),
                skipped = archive.len() - i,
                "extraction budget exhausted"
            );
            break;
        }

        let mut entry = match archive.by_index(i) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(archive = %zip_path.display(), index = i, error = %e, "unreadable entry");
                skipped_entries += 1;
                continue;
            }
        };
        // enclosed_name rejects entries that would escape the cache dir.
        let Some(rel) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            skipped_entries += 1;
            continue;
        };
        if entry.name().ends_with('/') {
            std::fs::create_dir_all(out_dir.join(&rel))?;
            continue;
        }

        let out_path = out_dir.join(&rel);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let declared_size = entry.size();
        let mut out_file = File::create(&out_path)?;
        let mut limited = (&mut entry).take(MAX_ENTRY_BYTES);
        let copied = std::io::copy(&mut limited, &mut out_file);

        let rel_str = rel.to_string_lossy().to_string();
        let kind = FileKind::from_path(&rel);
        match copied {
            Ok(written) if declared_size <= MAX_ENTRY_BYTES => {
                total_bytes += written;
                let content_hash = compute_sha256(&out_path).unwrap_or_default();
                let encoding = match kind {
                    FileKind::Text => detect_encoding(&out_path),
                    _ => None,
                };
                files.push(ExtractedFile {
                    rel_path: rel_str,
                    cache_path: out_path,
                    kind,
                    size_bytes: written,
                    content_hash,
                    is_corrupt: false,
                    encoding,
                });
            }
            Ok(written) => {
                // Hit the per-entry cap; keep the truncated file but flag it.
                total_bytes += written;
                files.push(ExtractedFile {
                    rel_path: rel_str,
                    cache_path: out_path,
                    kind,
                    size_bytes: written,
                    content_hash: String::new(),
                    is_corrupt: true,
                    encoding: None,
                });
            }
            Err(e) => {
                tracing::warn!(entry = %rel_str, error = %e, "entry read failed; marked corrupt");
                files.push(ExtractedFile {
                    rel_path: rel_str,
                    cache_path: out_path,
                    kind,
                    size_bytes: 0,
                    content_hash: String::new(),
                    is_corrupt: true,
                    encoding: None,
                });
            }
        }
    }

    Ok(Extraction {
        files,
        skipped_entries,
    })
}

/// Best-effort encoding probe for text-like files. The result is
/// recorded for viewers; content is never transcoded here.
pub fn detect_encoding(path: &Path) -> Option<&'static str> {
    let mut buf = [0u8; 4096];
    let mut file = File::open(path).ok()?;
    let n = file.read(&mut buf).ok()?;
    let bytes = &buf[..n];

    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        return Some("utf-8-bom");
    }
    if bytes.starts_with(&[0xFF, 0xFE]) {
        return Some("utf-16le");
    }
    if bytes.starts_with(&[0xFE, 0xFF]) {
        return Some("utf-16be");
    }
    match std::str::from_utf8(bytes) {
        Ok(_) => Some("utf-8"),
        // A prefix read can split a multi-byte sequence at the buffer edge.
        Err(e) if e.valid_up_to() + 3 >= bytes.len() => Some("utf-8"),
        Err(_) => Some("windows-1252"),
    }
}
