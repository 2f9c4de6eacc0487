//! Python programs compiled into the binary.
//!
//! The unittest adapter needs two small Python programs. Neither is
//! expected to be installed in the user's environment:
//!
//! - [`Script::Discovery`] prints dotted test ids after a `start` marker.
//!   Its source is handed to `python -c`, so it never touches disk.
//! - [`Script::Launcher`] runs the selected tests and streams results to
//!   the result port. It is invoked as `python <path>`, so it is written
//!   to `$TMPDIR/pyrunner-<version>/` the first time a run needs it.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use include_dir::{Dir, include_dir};
use tracing::debug;

static SOURCES: Dir = include_dir!("$CARGO_MANIFEST_DIR/scripts");

/// Paths of scripts already written by this process, by `Script as usize`.
static WRITTEN: [OnceLock<PathBuf>; 2] = [OnceLock::new(), OnceLock::new()];

pub type BundledResult<T> = Result<T, BundledError>;

#[derive(Debug, thiserror::Error)]
pub enum BundledError {
    /// The binary was built without the script.
    #[error("{0} is missing from this build")]
    Missing(&'static str),

    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A Python program shipped with pyrunner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Discovery,
    Launcher,
}

impl Script {
    pub fn file_name(self) -> &'static str {
        match self {
            Script::Discovery => "unittest_discovery.py",
            Script::Launcher => "unittest_launcher.py",
        }
    }

    /// Source text of the script.
    pub fn source(self) -> BundledResult<&'static str> {
        SOURCES
            .get_file(self.file_name())
            .and_then(|file| file.contents_utf8())
            .ok_or(BundledError::Missing(self.file_name()))
    }

    /// A path the script can be run from, writing it out on first use.
    ///
    /// Failures are not cached; the next call tries again.
    pub fn path(self) -> BundledResult<PathBuf> {
        let slot = &WRITTEN[self as usize];
        if let Some(path) = slot.get() {
            return Ok(path.clone());
        }
        let path = write_script(&scripts_dir(), self.file_name(), self.source()?)?;
        Ok(slot.get_or_init(|| path).clone())
    }
}

/// Per-version so that upgrading pyrunner never runs a stale launcher.
fn scripts_dir() -> PathBuf {
    std::env::temp_dir().join(format!("pyrunner-{}", env!("CARGO_PKG_VERSION")))
}

/// Writes `source` to `dir/name` unless an identical file is already there.
///
/// The file is staged next to its target and renamed into place, so
/// concurrent pyrunner processes never see a half-written script.
fn write_script(dir: &Path, name: &str, source: &str) -> BundledResult<PathBuf> {
    let target = dir.join(name);
    if fs::read_to_string(&target).is_ok_and(|existing| existing == source) {
        return Ok(target);
    }

    let write_error = |source| BundledError::Write {
        path: target.clone(),
        source,
    };
    fs::create_dir_all(dir).map_err(write_error)?;
    let mut staged = tempfile::NamedTempFile::new_in(dir).map_err(write_error)?;
    staged.write_all(source.as_bytes()).map_err(write_error)?;
    staged.persist(&target).map_err(|e| write_error(e.error))?;

    debug!("Wrote {}", target.display());
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launcher_path_holds_source() -> Result<(), Box<dyn std::error::Error>> {
        let path = Script::Launcher.path()?;
        assert!(path.ends_with(Script::Launcher.file_name()));
        assert_eq!(fs::read_to_string(&path)?, Script::Launcher.source()?);
        assert_eq!(Script::Launcher.path()?, path);
        Ok(())
    }

    #[test]
    fn test_discovery_prints_start_marker() -> Result<(), Box<dyn std::error::Error>> {
        assert!(Script::Discovery.source()?.contains("print(\"start\")"));
        Ok(())
    }

    #[test]
    fn test_write_script_replaces_stale_copy() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("launcher.py"), "old")?;

        let path = write_script(dir.path(), "launcher.py", "new")?;
        assert_eq!(fs::read_to_string(&path)?, "new");
        assert_eq!(fs::read_dir(dir.path())?.count(), 1);

        let nested = dir.path().join("a/b");
        let path = write_script(&nested, "launcher.py", "new")?;
        assert_eq!(path, nested.join("launcher.py"));
        Ok(())
    }

    #[test]
    fn test_unwritable_dir() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "").unwrap();

        match write_script(&blocker.join("sub"), "launcher.py", "x") {
            Err(BundledError::Write { path, .. }) => assert!(path.ends_with("sub/launcher.py")),
            other => panic!("unexpected result {other:?}"),
        }
    }
}
