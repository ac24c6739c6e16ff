//! Where a folder's database lives.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Directory created inside a scanned folder for [`DbScope::Folder`].
pub const FOLDER_DB_DIR: &str = ".facesort";
const FOLDER_DB_FILE: &str = "faces.db";

/// Placement policy for folder databases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbScope {
    /// `<folder>/.facesort/faces.db`, travels with the photos.
    #[default]
    Folder,
    /// `<data_dir>/databases/<hash>.db`, leaves the folder untouched.
    Central,
}

impl fmt::Display for DbScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DbScope::Folder => "folder",
            DbScope::Central => "central",
        })
    }
}

impl FromStr for DbScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "folder" => Ok(DbScope::Folder),
            "central" => Ok(DbScope::Central),
            other => Err(format!("unknown database scope '{other}' (expected folder or central)")),
        }
    }
}

/// Database path for `folder`. The same folder always maps to the same path,
/// however it is spelled.
pub fn database_path(folder: &Path, scope: DbScope, data_dir: &Path) -> std::io::Result<PathBuf> {
    let folder = folder.canonicalize()?;
    Ok(match scope {
        DbScope::Folder => folder.join(FOLDER_DB_DIR).join(FOLDER_DB_FILE),
        DbScope::Central => {
            let mut hasher = Sha256::new();
            hasher.update(folder.as_os_str().as_encoded_bytes());
            let digest = format!("{:x}", hasher.finalize());
            data_dir.join("databases").join(format!("{}.db", &digest[..16]))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_scope() {
        let tmp = tempfile::tempdir().unwrap();
        let path = database_path(tmp.path(), DbScope::Folder, Path::new("/unused")).unwrap();
        assert!(path.ends_with(".facesort/faces.db"));
        assert!(path.starts_with(tmp.path().canonicalize().unwrap()));
    }

    #[test]
    fn test_central_scope_is_stable_per_folder() {
        let tmp = tempfile::tempdir().unwrap();
        let photos = tmp.path().join("photos");
        let other = tmp.path().join("other");
        std::fs::create_dir_all(&photos).unwrap();
        std::fs::create_dir_all(&other).unwrap();
        let data = tmp.path().join("data");

        let a = database_path(&photos, DbScope::Central, &data).unwrap();
        let b = database_path(&photos.join("../photos"), DbScope::Central, &data).unwrap();
        let c = database_path(&other, DbScope::Central, &data).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with(data.join("databases")));
        assert_eq!(a.file_name().unwrap().len(), 16 + ".db".len());
    }

    #[test]
    fn test_missing_folder_errors() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(database_path(&tmp.path().join("nope"), DbScope::Folder, tmp.path()).is_err());
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!("Central".parse::<DbScope>().unwrap(), DbScope::Central);
        assert_eq!(DbScope::default().to_string(), "folder");
        assert!("cloud".parse::<DbScope>().is_err());
    }
}
