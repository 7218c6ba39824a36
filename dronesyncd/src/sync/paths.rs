use std::path::{Path, PathBuf};

use thiserror::Error;

/// Filename prefix of a file whose transfer has not been committed yet.
pub const DOWNLOADING_PREFIX: &str = "downloading_";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("name is empty")]
    Empty,
    #[error("name contains unsupported component: {0}")]
    UnsupportedComponent(String),
}

pub fn is_marked(name: &str) -> bool {
    name.starts_with(DOWNLOADING_PREFIX)
}

pub fn marked(name: &str) -> String {
    format!("{DOWNLOADING_PREFIX}{name}")
}

pub fn unmarked(name: &str) -> &str {
    name.strip_prefix(DOWNLOADING_PREFIX).unwrap_or(name)
}

/// Suffix of the record left next to a staging file once its fetch completed.
pub const FETCHED_SUFFIX: &str = ".fetched";

pub fn is_fetched_record(name: &str) -> bool {
    is_marked(name) && name.ends_with(FETCHED_SUFFIX)
}

/// Record path for the staging file at `staging`.
pub fn fetched_record_for(staging: &Path) -> PathBuf {
    let mut name = staging.file_name().unwrap_or_default().to_os_string();
    name.push(FETCHED_SUFFIX);
    staging.with_file_name(name)
}

/// Joins a POSIX-like remote directory and a child name.
pub fn remote_join(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    let name = name.trim_matches('/');
    match (dir.is_empty(), name.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{name}"),
        (false, true) => dir.to_string(),
        (false, false) => format!("{dir}/{name}"),
    }
}

/// Accepts a single path component as listed by the remote side.
pub fn checked_name(name: &str) -> Result<&str, PathError> {
    if name.is_empty() {
        return Err(PathError::Empty);
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(PathError::UnsupportedComponent(name.to_string()));
    }
    Ok(name)
}

/// Local directory mirroring one remote category under `root`.
pub fn local_dir_for(root: &Path, category: &str) -> Result<PathBuf, PathError> {
    Ok(root.join(checked_name(category)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_round_trip() {
        let name = marked("photo.jpg");
        assert_eq!(name, "downloading_photo.jpg");
        assert!(is_marked(&name));
        assert_eq!(unmarked(&name), "photo.jpg");
        assert_eq!(unmarked("photo.jpg"), "photo.jpg");
        assert!(!is_marked("photo_downloading_.jpg"));
    }

    #[test]
    fn fetched_record_sits_next_to_staging_file() {
        let record = fetched_record_for(Path::new("/data/Bebop/downloading_a.jpg"));
        assert_eq!(record, PathBuf::from("/data/Bebop/downloading_a.jpg.fetched"));
        assert!(is_fetched_record("downloading_a.jpg.fetched"));
        assert!(!is_fetched_record("a.jpg.fetched"));
        assert!(!is_fetched_record("downloading_a.jpg"));
    }

    #[test]
    fn joins_remote_components() {
        assert_eq!(remote_join("", ""), "/");
        assert_eq!(remote_join("/", "Bebop"), "/Bebop");
        assert_eq!(remote_join("/Bebop/", "academy"), "/Bebop/academy");
        assert_eq!(
            remote_join(&remote_join("/internal_000", "Bebop"), "academy/"),
            "/internal_000/Bebop/academy"
        );
    }

    #[test]
    fn maps_category_under_root() {
        let root = PathBuf::from("/data/academy");
        let mapped = local_dir_for(&root, "Bebop").unwrap();
        assert_eq!(mapped, PathBuf::from("/data/academy/Bebop"));
    }

    #[test]
    fn rejects_traversal_and_separators() {
        assert!(matches!(checked_name(""), Err(PathError::Empty)));
        assert!(matches!(
            checked_name(".."),
            Err(PathError::UnsupportedComponent(_))
        ));
        assert!(matches!(
            checked_name("a/b"),
            Err(PathError::UnsupportedComponent(_))
        ));
    }
}
