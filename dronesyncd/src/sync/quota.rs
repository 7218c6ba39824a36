use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::error::EngineError;
use super::paths::is_marked;

pub const DEFAULT_SPACE_PERCENT: f64 = 20.0;

/// Budget bookkeeping for one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QuotaState {
    pub used: u64,
    pub allowed: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepOutcome {
    pub used_before: u64,
    pub used_after: u64,
    pub allowed: u64,
    pub deleted: Vec<PathBuf>,
}

/// Fraction of `free` bytes the local tree may occupy.
pub fn allowed_budget(free: u64, space_percent: f64) -> u64 {
    let percent = space_percent.clamp(0.0, 100.0);
    (free as f64 * percent / 100.0) as u64
}

/// Trims `root` down to its share of the free space on its volume.
pub async fn enforce(root: &Path, space_percent: f64) -> Result<SweepOutcome, EngineError> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let free = fs2::available_space(&root)?;
        enforce_with_free_space(&root, space_percent, free)
    })
    .await?
}

/// Two walks over `root`: the first sums every regular file, the second
/// removes files in walk order until the sum fits the budget. Files still
/// carrying the downloading marker are counted but never removed.
pub fn enforce_with_free_space(
    root: &Path,
    space_percent: f64,
    free: u64,
) -> Result<SweepOutcome, EngineError> {
    let mut state = QuotaState {
        used: 0,
        allowed: allowed_budget(free, space_percent),
    };

    for entry in WalkDir::new(root) {
        let entry = entry?;
        if entry.file_type().is_file() {
            state.used = state.used.saturating_add(entry.metadata()?.len());
        }
    }

    let mut outcome = SweepOutcome {
        used_before: state.used,
        allowed: state.allowed,
        ..SweepOutcome::default()
    };

    if state.used > state.allowed {
        for entry in WalkDir::new(root) {
            if state.used <= state.allowed {
                break;
            }
            let entry = entry?;
            if !entry.file_type().is_file() || is_marked(&entry.file_name().to_string_lossy()) {
                continue;
            }
            let size = entry.metadata()?.len();
            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    state.used = state.used.saturating_sub(size);
                    outcome.deleted.push(entry.into_path());
                }
                Err(err) => {
                    tracing::warn!(
                        path = %entry.path().display(),
                        error = %err,
                        "quota sweep could not remove file"
                    );
                }
            }
        }
    }

    outcome.used_after = state.used;
    if !outcome.deleted.is_empty() {
        tracing::info!(
            deleted = outcome.deleted.len(),
            used = outcome.used_after,
            allowed = outcome.allowed,
            "quota sweep freed space"
        );
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(root: &Path, rel: &str, len: usize) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, vec![7u8; len]).unwrap();
    }

    #[test]
    fn budget_is_a_share_of_free_space() {
        assert_eq!(allowed_budget(1000, 20.0), 200);
        assert_eq!(allowed_budget(1000, 0.0), 0);
        assert_eq!(allowed_budget(1000, 250.0), 1000);
    }

    #[test]
    fn within_budget_deletes_nothing() {
        let dir = tempdir().unwrap();
        write(dir.path(), "Bebop/a.pud", 100);
        write(dir.path(), "Bebop/b.pud", 50);

        let outcome = enforce_with_free_space(dir.path(), 20.0, 1000).unwrap();

        assert_eq!(outcome.used_before, 150);
        assert_eq!(outcome.allowed, 200);
        assert!(outcome.deleted.is_empty());
        assert!(dir.path().join("Bebop/a.pud").exists());
    }

    #[test]
    fn over_budget_removes_files_until_it_fits() {
        let dir = tempdir().unwrap();
        for name in ["a", "b", "c", "d"] {
            write(dir.path(), &format!("Bebop/{name}.pud"), 100);
        }

        let outcome = enforce_with_free_space(dir.path(), 25.0, 1000).unwrap();

        assert_eq!(outcome.used_before, 400);
        assert_eq!(outcome.allowed, 250);
        assert_eq!(outcome.deleted.len(), 2);
        assert_eq!(outcome.used_after, 200);
        let remaining = WalkDir::new(dir.path())
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .count();
        assert_eq!(remaining, 2);
    }

    #[test]
    fn marked_files_are_counted_but_kept() {
        let dir = tempdir().unwrap();
        write(dir.path(), "Bebop/downloading_a.pud", 300);
        write(dir.path(), "Bebop/b.pud", 100);

        let outcome = enforce_with_free_space(dir.path(), 10.0, 1000).unwrap();

        assert_eq!(outcome.used_before, 400);
        assert_eq!(outcome.deleted, vec![dir.path().join("Bebop/b.pud")]);
        assert_eq!(outcome.used_after, 300);
        assert!(dir.path().join("Bebop/downloading_a.pud").exists());
    }

    #[tokio::test]
    async fn zero_percent_clears_committed_files() {
        let dir = tempdir().unwrap();
        write(dir.path(), "Bebop/a.pud", 10);
        write(dir.path(), "Disco/b.pud", 10);
        write(dir.path(), "Disco/downloading_c.pud", 10);

        let outcome = enforce(dir.path(), 0.0).await.unwrap();

        assert_eq!(outcome.deleted.len(), 2);
        assert!(!dir.path().join("Bebop/a.pud").exists());
        assert!(dir.path().join("Disco/downloading_c.pud").exists());
    }

    #[tokio::test]
    async fn missing_root_is_a_system_error() {
        let dir = tempdir().unwrap();
        let err = enforce(&dir.path().join("absent"), 20.0).await.unwrap_err();
        assert!(matches!(err, EngineError::System(_)));
    }
}
