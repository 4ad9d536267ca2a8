//! Durable file helpers shared by the filesystem-backed stores.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Flushes a file's data and metadata to stable storage.
pub(crate) fn sync_file(path: &Path) -> Result<(), std::io::Error> {
    OpenOptions::new().write(true).open(path)?.sync_all()
}

/// Flushes a directory entry list so a completed rename survives a crash.
///
/// Only Unix exposes directory handles that can be synced; elsewhere the
/// rename is trusted as is.
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> Result<(), std::io::Error> {
    std::fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
pub(crate) fn sync_dir(_dir: &Path) -> Result<(), std::io::Error> {
    Ok(())
}

/// Replaces `path` with `contents` via write-temp, fsync, rename.
///
/// Readers see either the previous file or the complete new one.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), std::io::Error> {
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = Path::new(&tmp_name);

    std::fs::write(tmp_path, contents)?;
    sync_file(tmp_path)?;
    std::fs::rename(tmp_path, path)?;
    sync_dir(dir)
}

/// Appends `lines` (each terminated by `\n`) to `path` and syncs the data.
pub(crate) fn append_lines<I, S>(path: &Path, lines: I) -> Result<(), std::io::Error>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut buf = String::new();
    for line in lines {
        buf.push_str(line.as_ref());
        buf.push('\n');
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    f.write_all(buf.as_bytes())?;
    f.sync_data()
}

/// Reads the non-empty lines of `path`; a missing file has no lines.
pub(crate) fn read_lines(path: &Path) -> Result<Vec<String>, std::io::Error> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Reads `path` to a string, mapping a missing file to `None`.
pub(crate) fn read_optional(path: &Path) -> Result<Option<String>, std::io::Error> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        assert!(!dir.path().join("nested").join("doc.json.tmp").exists());
    }

    #[test]
    fn test_append_and_read_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        assert!(read_lines(&path).unwrap().is_empty());
        append_lines(&path, ["a", "b"]).unwrap();
        append_lines(&path, ["c"]).unwrap();
        assert_eq!(read_lines(&path).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_sync_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, b"{}").unwrap();
        sync_file(&path).unwrap();
        sync_dir(dir.path()).unwrap();
        assert!(sync_file(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_read_optional_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_optional(&dir.path().join("nope")).unwrap(), None);
    }
}
