use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Update `path` with `data` so that a concurrent reader always sees either
/// the old or the new content, never a torn file.
///
/// Protocol: write `<path>.new` (mode 0600), move any existing file to
/// `<path>.old`, rename `<path>.new` into place. If the file already holds
/// exactly `data`, nothing is touched.
///
/// Returns `true` when the file content changed.
pub fn safe_update(path: &Path, data: &[u8]) -> std::io::Result<bool> {
    if !path.is_file() {
        let mut fd = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        fd.write_all(data)?;
        return Ok(true);
    }

    let old_data = fs::read(path)?;
    if old_data == data {
        return Ok(false);
    }

    let new_path = with_suffix(path, ".new");
    let bck_path = with_suffix(path, ".old");

    // A stale backup from a previous update may be in the way.
    let _ = fs::remove_file(&bck_path);

    let mut fd = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(&new_path)?;
    fd.write_all(data)?;
    drop(fd);

    let _ = fs::rename(path, &bck_path);
    fs::rename(&new_path, path)?;
    Ok(true)
}

pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Create a directory tree if missing.
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.is_dir() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}
