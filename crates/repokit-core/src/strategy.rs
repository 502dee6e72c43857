//! Ranked lookup of repository overrides.
//!
//! Each operation lists the files it can use in priority order; the first
//! one present in the repository wins. Callers fall back to their bundled
//! default when nothing matches.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// What kind of filesystem entry a candidate must be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Regular file with an execute bit.
    Executable,
    /// Regular file.
    File,
    Directory,
}

/// One ranked candidate for an operation.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<S> {
    pub relative_path: &'static str,
    pub kind: SourceKind,
    pub strategy: S,
}

impl<S> Candidate<S> {
    pub const fn executable(relative_path: &'static str, strategy: S) -> Self {
        Self {
            relative_path,
            kind: SourceKind::Executable,
            strategy,
        }
    }

    pub const fn file(relative_path: &'static str, strategy: S) -> Self {
        Self {
            relative_path,
            kind: SourceKind::File,
            strategy,
        }
    }

    pub const fn directory(relative_path: &'static str, strategy: S) -> Self {
        Self {
            relative_path,
            kind: SourceKind::Directory,
            strategy,
        }
    }
}

/// The candidate that won, with its absolute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<S> {
    pub strategy: S,
    pub path: PathBuf,
}

/// Return the first candidate present under `root`, in list order.
pub fn first_present<S: Copy>(root: &Path, candidates: &[Candidate<S>]) -> Option<Resolved<S>> {
    for candidate in candidates {
        let path = root.join(candidate.relative_path);
        if matches_kind(&path, candidate.kind) {
            debug!(path = %path.display(), "Using repository override");
            return Some(Resolved {
                strategy: candidate.strategy,
                path,
            });
        }
        if path.exists() {
            warn!(
                path = %path.display(),
                expected = ?candidate.kind,
                "Ignoring override of the wrong kind"
            );
        }
    }
    None
}

fn matches_kind(path: &Path, kind: SourceKind) -> bool {
    match kind {
        SourceKind::Directory => path.is_dir(),
        SourceKind::File => path.is_file(),
        SourceKind::Executable => path.is_file() && is_executable(path),
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Source {
        Script,
        Sql,
    }

    const CANDIDATES: [Candidate<Source>; 2] = [
        Candidate::executable("database/insert_test_data", Source::Script),
        Candidate::file("database/insert_test_data.sql", Source::Sql),
    ];

    fn repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("database")).unwrap();
        dir
    }

    #[cfg(unix)]
    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        fs::write(path, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_nothing_present() {
        let dir = repo();
        assert_eq!(first_present(dir.path(), &CANDIDATES), None);
    }

    #[test]
    fn test_second_candidate_used_when_first_missing() {
        let dir = repo();
        fs::write(dir.path().join("database/insert_test_data.sql"), "select 1;").unwrap();

        let resolved = first_present(dir.path(), &CANDIDATES).unwrap();
        assert_eq!(resolved.strategy, Source::Sql);
        assert_eq!(resolved.path, dir.path().join("database/insert_test_data.sql"));
    }

    #[cfg(unix)]
    #[test]
    fn test_first_candidate_wins() {
        let dir = repo();
        make_executable(&dir.path().join("database/insert_test_data"));
        fs::write(dir.path().join("database/insert_test_data.sql"), "select 1;").unwrap();

        let resolved = first_present(dir.path(), &CANDIDATES).unwrap();
        assert_eq!(resolved.strategy, Source::Script);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_executable_script_skipped() {
        let dir = repo();
        fs::write(dir.path().join("database/insert_test_data"), "#!/bin/sh\n").unwrap();
        fs::write(dir.path().join("database/insert_test_data.sql"), "select 1;").unwrap();

        let resolved = first_present(dir.path(), &CANDIDATES).unwrap();
        assert_eq!(resolved.strategy, Source::Sql);
    }

    #[test]
    fn test_directory_candidate() {
        let dir = repo();
        fs::create_dir_all(dir.path().join("database/sqitch")).unwrap();
        let candidates = [Candidate::directory("database/sqitch", ())];
        assert!(first_present(dir.path(), &candidates).is_some());

        let files = [Candidate::file("database/sqitch", ())];
        assert!(first_present(dir.path(), &files).is_none());
    }
}
