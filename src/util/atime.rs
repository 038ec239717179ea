//! Reading files without disturbing their access time.
//!
//! Backups read every file at least once per run. Left alone, that would bump
//! every atime on the host, so the times are captured before the read and
//! written back afterwards.

use std::{fs::File, io, path::Path};

use filetime::FileTime;

/// Access and modification times captured from a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTimes {
    pub accessed: FileTime,
    pub modified: FileTime,
}

impl FileTimes {
    pub fn capture(path: &Path) -> io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            accessed: FileTime::from_last_access_time(&meta),
            modified: FileTime::from_last_modification_time(&meta),
        })
    }

    /// Write the captured times back. Failure is logged, not returned: a file
    /// we may read but not own cannot have its times set, and that must not
    /// stop the backup.
    pub fn restore(&self, path: &Path) {
        if let Err(e) = filetime::set_file_times(path, self.accessed, self.modified) {
            warn!("could not restore times on {}: {e}", path.display());
        }
    }
}

/// Open `path`, hand it to `f`, then restore the original access and
/// modification times whether or not `f` succeeded.
pub fn with_times_restored<T, F>(path: &Path, f: F) -> io::Result<T>
where
    F: FnOnce(&mut File) -> io::Result<T>,
{
    let times = FileTimes::capture(path)?;
    let result = {
        let mut file = File::open(path)?;
        f(&mut file)
    };
    times.restore(path);
    result
}
