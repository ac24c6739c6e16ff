//! Image enumeration.

use crate::error::{ScanError, ScanWarning, WarningKind};
use facesort_store::{Fingerprint, FOLDER_DB_DIR};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

/// One image file under the scanned folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    /// Path relative to the folder, `/`-separated. The database key.
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub fingerprint: Fingerprint,
}

/// Recursively list images under `folder` whose extension is in
/// `extensions` (case-insensitive), sorted by relative path.
///
/// Entries that cannot be read become warnings; only an unreadable `folder`
/// itself is an error. The database directory is never descended into.
pub fn list_images(
    folder: &Path,
    extensions: &[String],
) -> Result<(Vec<ImageEntry>, Vec<ScanWarning>), ScanError> {
    std::fs::read_dir(folder).map_err(|source| ScanError::FolderUnreadable {
        path: folder.to_path_buf(),
        source,
    })?;

    let mut images = Vec::new();
    let mut warnings = Vec::new();
    let walker = WalkDir::new(folder)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| !(e.depth() > 0 && e.file_type().is_dir() && e.file_name() == FOLDER_DB_DIR));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err
                    .path()
                    .map(|p| relative(folder, p))
                    .unwrap_or_default();
                warnings.push(ScanWarning::new(path, WarningKind::Io, err.to_string()));
                continue;
            }
        };
        if !entry.file_type().is_file() || !has_extension(entry.path(), extensions) {
            continue;
        }

        let rel_path = relative(folder, entry.path());
        match entry.metadata() {
            Ok(meta) => images.push(ImageEntry {
                rel_path,
                abs_path: entry.into_path(),
                fingerprint: fingerprint(&meta),
            }),
            Err(err) => warnings.push(ScanWarning::new(rel_path, WarningKind::Io, err.to_string())),
        }
    }

    images.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    tracing::debug!(folder = %folder.display(), images = images.len(), "enumerated images");
    Ok((images, warnings))
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext)))
}

fn relative(folder: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(folder).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn fingerprint(meta: &Metadata) -> Fingerprint {
    let mtime_ns = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    Fingerprint { size: meta.len(), mtime_ns }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exts() -> Vec<String> {
        vec!["jpg".into(), "jpeg".into(), "png".into()]
    }

    #[test]
    fn test_lists_images_sorted_and_filtered() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("b/nested")).unwrap();
        std::fs::create_dir_all(root.join(FOLDER_DB_DIR)).unwrap();
        for name in ["z.JPG", "a.png", "b/nested/c.jpeg", "notes.txt", ".facesort/x.jpg"] {
            std::fs::write(root.join(name), b"data").unwrap();
        }

        let (images, warnings) = list_images(root, &exts()).unwrap();
        assert!(warnings.is_empty());
        let paths: Vec<_> = images.iter().map(|i| i.rel_path.as_str()).collect();
        assert_eq!(paths, ["a.png", "b/nested/c.jpeg", "z.JPG"]);
        assert_eq!(images[0].fingerprint.size, 4);
        assert!(images[0].abs_path.ends_with("a.png"));
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("a.jpg");
        std::fs::write(&file, b"one").unwrap();
        let (before, _) = list_images(tmp.path(), &exts()).unwrap();
        std::fs::write(&file, b"three").unwrap();
        let (after, _) = list_images(tmp.path(), &exts()).unwrap();
        assert_ne!(before[0].fingerprint, after[0].fingerprint);
    }

    #[test]
    fn test_missing_folder_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let err = list_images(&tmp.path().join("gone"), &exts()).unwrap_err();
        assert!(matches!(err, ScanError::FolderUnreadable { .. }));
    }
}
