//! Idempotent filesystem writes.

use std::fs;
use std::io::Write;
use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};

/// File mode for private keys.
pub const PRIVATE_MODE: u32 = 0o600;

/// File mode for public material.
pub const PUBLIC_MODE: u32 = 0o644;

/// Outcome of an idempotent write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The file was created or its content replaced.
    Written,
    /// The file already had the requested content (or must not be replaced).
    Unchanged,
}

/// Creates `path` with `contents` only if it does not exist yet.
///
/// # Errors
///
/// Returns [`Error::Io`] if the file cannot be created.
pub fn write_if_absent(path: &Path, contents: &[u8], mode: u32) -> Result<WriteOutcome> {
    if path.exists() {
        debug!(path = %path.display(), "keeping existing file");
        return Ok(WriteOutcome::Unchanged);
    }
    ensure_parent(path)?;
    let mut file = create_new_with_mode(path, mode)?;
    file.write_all(contents).map_err(Error::io(path))?;
    file.sync_all().map_err(Error::io(path))?;
    Ok(WriteOutcome::Written)
}

/// Writes `contents` to `path` unless the file already holds exactly those
/// bytes, so unchanged artifacts keep their timestamps.
///
/// # Errors
///
/// Returns [`Error::Io`] on read or write failure.
pub fn write_if_changed(path: &Path, contents: &[u8], mode: u32) -> Result<WriteOutcome> {
    match fs::read(path) {
        Ok(existing) if existing == contents => return Ok(WriteOutcome::Unchanged),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::io(path)(e)),
    }
    atomic_write(path, contents, mode)?;
    Ok(WriteOutcome::Written)
}

/// Replaces `path` atomically via a temporary file in the same directory.
///
/// # Errors
///
/// Returns [`Error::Io`] if the temporary file cannot be written or renamed.
pub fn atomic_write(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let dir = ensure_parent(path)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(Error::io(dir))?;
    tmp.write_all(contents).map_err(Error::io(tmp.path()))?;
    tmp.as_file().sync_all().map_err(Error::io(tmp.path()))?;
    set_mode(tmp.path(), mode)?;
    tmp.persist(path).map_err(|e| Error::io(path)(e.error))?;
    Ok(())
}

/// Reads a file, mapping a missing file to [`Error::MissingInput`].
///
/// # Errors
///
/// Returns [`Error::MissingInput`] or [`Error::Io`].
pub fn read_required(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::MissingInput(path.to_path_buf())
        } else {
            Error::io(path)(e)
        }
    })
}

/// Reads a UTF-8 file, mapping a missing file to [`Error::MissingInput`].
///
/// # Errors
///
/// Returns [`Error::MissingInput`], [`Error::Io`], or [`Error::Parse`] for
/// non UTF-8 content.
pub fn read_required_text(path: &Path) -> Result<String> {
    String::from_utf8(read_required(path)?)
        .map_err(|_| Error::Parse(format!("{} is not valid UTF-8", path.display())))
}

fn ensure_parent(path: &Path) -> Result<&Path> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(Error::io(parent))?;
    Ok(parent)
}

fn create_new_with_mode(path: &Path, mode: u32) -> Result<fs::File> {
    let mut opts = fs::OpenOptions::new();
    opts.create_new(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    opts.open(path).map_err(Error::io(path))
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(Error::io(path))?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_if_absent_never_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/node.key");

        assert_eq!(write_if_absent(&path, b"first", PRIVATE_MODE).unwrap(), WriteOutcome::Written);
        assert_eq!(write_if_absent(&path, b"second", PRIVATE_MODE).unwrap(), WriteOutcome::Unchanged);
        assert_eq!(fs::read(&path).unwrap(), b"first");
    }

    #[cfg(unix)]
    #[test]
    fn private_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k");
        write_if_absent(&path, b"secret", PRIVATE_MODE).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, PRIVATE_MODE);
    }

    #[test]
    fn write_if_changed_skips_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("web.pem");

        assert_eq!(write_if_changed(&path, b"abc", PUBLIC_MODE).unwrap(), WriteOutcome::Written);
        let before = fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(write_if_changed(&path, b"abc", PUBLIC_MODE).unwrap(), WriteOutcome::Unchanged);
        assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), before);
        assert_eq!(write_if_changed(&path, b"xyz", PUBLIC_MODE).unwrap(), WriteOutcome::Written);
        assert_eq!(fs::read(&path).unwrap(), b"xyz");
    }

    #[test]
    fn read_required_reports_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read_required(&dir.path().join("nope")),
            Err(Error::MissingInput(_))
        ));
    }
}
