//! Hardened archive extraction (zip / tar / tar.gz).
//!
//! Guards against path traversal, absolute paths and drive prefixes, symlink
//! and other non-regular-file entries, and resource exhaustion. Limits are
//! tracked as a running budget that is charged while bytes are streamed to
//! disk, so metadata that understates an entry's size buys it nothing. On any
//! violation the destination directory is removed before the error surfaces.

use crate::error::ExtractError;
use flate2::read::GzDecoder;
use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use zip::ZipArchive;

/// Unix file-kind bits carried in zip external attributes.
const UNIX_KIND_MASK: u32 = 0o170000;
const UNIX_KIND_SYMLINK: u32 = 0o120000;

const SPILL_CHUNK: usize = 8 * 1024;

#[derive(Clone, Copy, Debug)]
pub struct ExtractLimits {
    pub max_files: usize,
    pub max_total_bytes: u64,
    pub max_file_bytes: u64,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        Self {
            max_files: 100,
            max_total_bytes: 10 * 1024 * 1024,
            max_file_bytes: 512 * 1024,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExtractReport {
    /// Relative paths of extracted regular files.
    pub extracted_files: Vec<PathBuf>,
    pub total_bytes: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
}

pub fn detect_archive_kind(file_name: &str) -> Option<ArchiveKind> {
    let lower = file_name.to_lowercase();
    if lower.ends_with(".zip") {
        Some(ArchiveKind::Zip)
    } else if lower.ends_with(".tar") {
        Some(ArchiveKind::Tar)
    } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        Some(ArchiveKind::TarGz)
    } else {
        None
    }
}

/// Replace anything outside `[A-Za-z0-9._-]` with `_`. Idempotent.
pub fn sanitize_filename(name: &str) -> String {
    let out: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() {
        "document".to_string()
    } else {
        out
    }
}

/// Extract `archive_path` into `dest_dir`, enforcing `limits`.
///
/// The destination is destroyed on failure so partial extractions never leak
/// into later processing.
pub fn safe_extract_archive(
    archive_path: &Path,
    file_name: &str,
    dest_dir: &Path,
    limits: ExtractLimits,
) -> Result<ExtractReport, ExtractError> {
    fs::create_dir_all(dest_dir)
        .map_err(|e| ExtractError::Decode(format!("create dest dir: {e}")))?;

    let result = match detect_archive_kind(file_name) {
        Some(ArchiveKind::Zip) => extract_zip(archive_path, dest_dir, limits),
        Some(ArchiveKind::Tar) => {
            open_file(archive_path).and_then(|f| extract_tar(f, dest_dir, limits))
        }
        Some(ArchiveKind::TarGz) => open_file(archive_path)
            .and_then(|f| extract_tar(GzDecoder::new(f), dest_dir, limits)),
        None => Err(ExtractError::UnknownFormat(file_name.to_string())),
    };

    if result.is_err() {
        let _ = fs::remove_dir_all(dest_dir);
    }
    result
}

fn open_file(path: &Path) -> Result<fs::File, ExtractError> {
    fs::File::open(path).map_err(|e| ExtractError::Decode(format!("open archive: {e}")))
}

/// Remaining allowance for one extraction run.
struct ExtractBudget {
    files_remaining: usize,
    bytes_remaining: u64,
    per_file_limit: u64,
}

impl ExtractBudget {
    fn new(limits: &ExtractLimits) -> Self {
        Self {
            files_remaining: limits.max_files,
            bytes_remaining: limits.max_total_bytes,
            per_file_limit: limits.max_file_bytes,
        }
    }

    /// Admit one more regular file, rejecting it up front when the size its
    /// metadata claims already busts a limit.
    fn admit(&mut self, rel: &Path, claimed_size: u64) -> Result<(), ExtractError> {
        if self.files_remaining == 0 {
            return Err(ExtractError::LimitExceeded(
                "too many files in archive".to_string(),
            ));
        }
        self.files_remaining -= 1;

        if claimed_size > self.per_file_limit {
            return Err(ExtractError::LimitExceeded(format!(
                "{} claims {claimed_size} bytes (per-file cap {})",
                rel.display(),
                self.per_file_limit
            )));
        }
        if claimed_size > self.bytes_remaining {
            return Err(ExtractError::LimitExceeded(
                "archive content exceeds total size cap".to_string(),
            ));
        }
        Ok(())
    }

    /// Charge bytes actually written for one file.
    fn charge(&mut self, rel: &Path, written_so_far: u64, chunk: u64) -> Result<(), ExtractError> {
        if written_so_far + chunk > self.per_file_limit {
            return Err(ExtractError::LimitExceeded(format!(
                "{} grew past the per-file cap while extracting",
                rel.display()
            )));
        }
        if chunk > self.bytes_remaining {
            return Err(ExtractError::LimitExceeded(
                "archive content exceeds total size cap".to_string(),
            ));
        }
        self.bytes_remaining -= chunk;
        Ok(())
    }
}

/// Stream one entry to disk in chunks, charging the budget as bytes land.
fn spill_entry<R: Read>(
    mut src: R,
    out_path: &Path,
    rel: &Path,
    budget: &mut ExtractBudget,
) -> Result<u64, ExtractError> {
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent).map_err(|e| ExtractError::Decode(e.to_string()))?;
    }
    let mut out =
        fs::File::create(out_path).map_err(|e| ExtractError::Decode(e.to_string()))?;

    let mut written = 0u64;
    let mut chunk = [0u8; SPILL_CHUNK];
    loop {
        let n = src
            .read(&mut chunk)
            .map_err(|e| ExtractError::Decode(e.to_string()))?;
        if n == 0 {
            return Ok(written);
        }
        budget.charge(rel, written, n as u64)?;
        out.write_all(&chunk[..n])
            .map_err(|e| ExtractError::Decode(e.to_string()))?;
        written += n as u64;
    }
}

/// Reject absolute paths, drive prefixes and parent-directory components;
/// strip `.` components.
fn contained_rel_path(raw: &Path) -> Result<PathBuf, ExtractError> {
    let mut names = Vec::new();
    for comp in raw.components() {
        match comp {
            Component::Normal(name) => names.push(name),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ExtractError::UnsafePath(raw.display().to_string()));
            }
        }
    }
    if names.is_empty() {
        return Err(ExtractError::UnsafePath("<empty>".to_string()));
    }
    Ok(names.into_iter().collect())
}

fn extract_zip(
    archive_path: &Path,
    dest_dir: &Path,
    limits: ExtractLimits,
) -> Result<ExtractReport, ExtractError> {
    let mut zip =
        ZipArchive::new(open_file(archive_path)?).map_err(|e| ExtractError::Decode(e.to_string()))?;

    let mut budget = ExtractBudget::new(&limits);
    let mut report = ExtractReport::default();

    for index in 0..zip.len() {
        let entry = zip
            .by_index(index)
            .map_err(|e| ExtractError::Decode(e.to_string()))?;
        let raw_name = entry.name().replace('\\', "/");
        if raw_name.is_empty() {
            continue;
        }

        // Zip encodes symlinks through the unix mode bits.
        if entry
            .unix_mode()
            .is_some_and(|mode| mode & UNIX_KIND_MASK == UNIX_KIND_SYMLINK)
        {
            return Err(ExtractError::SpecialEntry(raw_name));
        }

        let rel = contained_rel_path(Path::new(&raw_name))?;
        if entry.is_dir() {
            fs::create_dir_all(dest_dir.join(&rel))
                .map_err(|e| ExtractError::Decode(e.to_string()))?;
            continue;
        }

        budget.admit(&rel, entry.size())?;
        let written = spill_entry(entry, &dest_dir.join(&rel), &rel, &mut budget)?;

        report.total_bytes += written;
        report.extracted_files.push(rel);
    }

    Ok(report)
}

fn extract_tar<R: Read>(
    reader: R,
    dest_dir: &Path,
    limits: ExtractLimits,
) -> Result<ExtractReport, ExtractError> {
    let mut archive = Archive::new(reader);
    let mut budget = ExtractBudget::new(&limits);
    let mut report = ExtractReport::default();

    let entries = archive
        .entries()
        .map_err(|e| ExtractError::Decode(e.to_string()))?;

    for entry in entries {
        let entry = entry.map_err(|e| ExtractError::Decode(e.to_string()))?;
        let raw_path = entry
            .path()
            .map_err(|e| ExtractError::Decode(e.to_string()))?
            .into_owned();

        // Only plain files and directories are acceptable; links, devices
        // and fifos all get the archive rejected.
        let kind = entry.header().entry_type();
        if kind.is_dir() {
            let rel = contained_rel_path(&raw_path)?;
            fs::create_dir_all(dest_dir.join(rel))
                .map_err(|e| ExtractError::Decode(e.to_string()))?;
            continue;
        }
        if !kind.is_file() {
            return Err(ExtractError::SpecialEntry(raw_path.display().to_string()));
        }

        let rel = contained_rel_path(&raw_path)?;
        let claimed = entry.header().size().unwrap_or(0);
        budget.admit(&rel, claimed)?;
        let written = spill_entry(entry, &dest_dir.join(&rel), &rel, &mut budget)?;

        report.total_bytes += written;
        report.extracted_files.push(rel);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tmp(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis();
        let dir = PathBuf::from(format!("/tmp/{prefix}-{}-{ts}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        use zip::write::SimpleFileOptions;
        let f = fs::File::create(path).unwrap();
        let mut zw = zip::ZipWriter::new(f);
        for (name, data) in entries {
            zw.start_file(*name, SimpleFileOptions::default()).unwrap();
            zw.write_all(data).unwrap();
        }
        zw.finish().unwrap();
    }

    #[test]
    fn test_zip_traversal_rejected_and_dest_removed() {
        let base = tmp("zip-trav");
        let zip_path = base.join("a.zip");
        let out_dir = base.join("out");
        write_zip(&zip_path, &[("../evil.txt", b"x")]);

        let err =
            safe_extract_archive(&zip_path, "a.zip", &out_dir, ExtractLimits::default())
                .unwrap_err();
        assert!(matches!(err, ExtractError::UnsafePath(_)));
        assert!(!out_dir.exists());
    }

    #[test]
    fn test_zip_extracts_within_limits() {
        let base = tmp("zip-ok");
        let zip_path = base.join("a.zip");
        let out_dir = base.join("out");
        write_zip(&zip_path, &[("dir/a.txt", b"hello"), ("b.txt", b"world")]);

        let report =
            safe_extract_archive(&zip_path, "a.zip", &out_dir, ExtractLimits::default()).unwrap();
        assert_eq!(report.extracted_files.len(), 2);
        assert_eq!(report.total_bytes, 10);
        assert_eq!(fs::read_to_string(out_dir.join("dir/a.txt")).unwrap(), "hello");
    }

    #[test]
    fn test_per_file_limit_enforced() {
        let base = tmp("zip-size");
        let zip_path = base.join("a.zip");
        let out_dir = base.join("out");
        write_zip(&zip_path, &[("big.txt", b"hello")]);

        let limits = ExtractLimits {
            max_files: 10,
            max_total_bytes: 100,
            max_file_bytes: 4,
        };
        let err = safe_extract_archive(&zip_path, "a.zip", &out_dir, limits).unwrap_err();
        assert!(matches!(err, ExtractError::LimitExceeded(_)));
        assert!(!out_dir.exists());
    }

    #[test]
    fn test_total_limit_enforced() {
        let base = tmp("zip-total");
        let zip_path = base.join("a.zip");
        let out_dir = base.join("out");
        write_zip(&zip_path, &[("a.txt", b"hello"), ("b.txt", b"world")]);

        let limits = ExtractLimits {
            max_files: 10,
            max_total_bytes: 9,
            max_file_bytes: 10,
        };
        let err = safe_extract_archive(&zip_path, "a.zip", &out_dir, limits).unwrap_err();
        assert!(matches!(err, ExtractError::LimitExceeded(_)));
    }

    #[test]
    fn test_file_count_limit_enforced() {
        let base = tmp("zip-count");
        let zip_path = base.join("a.zip");
        let out_dir = base.join("out");
        write_zip(&zip_path, &[("a", b"1"), ("b", b"2"), ("c", b"3")]);

        let limits = ExtractLimits {
            max_files: 2,
            max_total_bytes: 100,
            max_file_bytes: 100,
        };
        let err = safe_extract_archive(&zip_path, "a.zip", &out_dir, limits).unwrap_err();
        assert!(matches!(err, ExtractError::LimitExceeded(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_tar_symlink_entry_rejected() {
        let base = tmp("tar-link");
        let src = base.join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("real.txt"), "x").unwrap();
        std::os::unix::fs::symlink("real.txt", src.join("link.txt")).unwrap();

        let tar_path = base.join("a.tar");
        let f = fs::File::create(&tar_path).unwrap();
        let mut builder = tar::Builder::new(f);
        builder.follow_symlinks(false);
        builder.append_dir_all(".", &src).unwrap();
        builder.finish().unwrap();

        let out_dir = base.join("out");
        let err =
            safe_extract_archive(&tar_path, "a.tar", &out_dir, ExtractLimits::default())
                .unwrap_err();
        assert!(matches!(err, ExtractError::SpecialEntry(_)));
        assert!(!out_dir.exists());
    }

    #[test]
    fn test_unknown_format_rejected() {
        let base = tmp("unknown");
        let path = base.join("a.rar");
        fs::write(&path, b"whatever").unwrap();
        let err = safe_extract_archive(&path, "a.rar", &base.join("out"), ExtractLimits::default())
            .unwrap_err();
        assert!(matches!(err, ExtractError::UnknownFormat(_)));
    }

    #[test]
    fn test_contained_rel_path() {
        assert!(contained_rel_path(Path::new("a/b.txt")).is_ok());
        assert_eq!(
            contained_rel_path(Path::new("./a/./b.txt")).unwrap(),
            PathBuf::from("a/b.txt")
        );
        assert!(contained_rel_path(Path::new("../b.txt")).is_err());
        assert!(contained_rel_path(Path::new("/abs/b.txt")).is_err());
        assert!(contained_rel_path(Path::new(".")).is_err());
    }

    #[test]
    fn test_sanitize_filename_fixed_point() {
        let once = sanitize_filename("my file (1).tar.gz");
        assert_eq!(once, "my_file__1_.tar.gz");
        assert_eq!(sanitize_filename(&once), once);
        assert_eq!(sanitize_filename(""), "document");
    }
}
