use std::fs::{File, OpenOptions};
use std::path::Path;

use nix::fcntl::{Flock, FlockArg};

/// Advisory exclusive lock over a lockfile, released on drop.
///
/// All collector advertises and queries of every controller in the process
/// (and of any sibling factory process sharing the lock directory) serialize
/// through these; the collector endpoint is single-threaded per process.
pub struct FileLock {
    _flock: Flock<File>,
}

impl FileLock {
    /// Block until the exclusive lock on `path` is acquired, creating the
    /// lockfile if needed.
    pub fn acquire(path: &Path) -> std::io::Result<FileLock> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let flock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| std::io::Error::from(errno))?;
        Ok(FileLock { _flock: flock })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_creates_file_and_releases_on_drop() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gfi_advertise.lock");
        {
            let _guard = FileLock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        // Re-acquirable once the guard is gone.
        let _guard = FileLock::acquire(&path).unwrap();
    }
}
