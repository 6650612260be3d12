use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

// Process-level lock guard backed by an OS file lock.
// Two collectors on the same modem would fight over its AT command channel.
pub struct LockGuard {
    file: File,
}

impl LockGuard {
    // Acquire an exclusive lock on `path` and record who holds it.
    pub fn acquire(path: &Path, holder: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("creating lock directory failed: {}", parent.display())
                })?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("opening lock file failed: {}", path.display()))?;

        file.try_lock_exclusive().with_context(|| {
            format!("another collector is already running: {}", path.display())
        })?;

        write_holder(&mut file, holder)
            .with_context(|| format!("writing lock file failed: {}", path.display()))?;

        Ok(Self { file })
    }
}

fn write_holder(file: &mut File, holder: &str) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{} {}", std::process::id(), holder)?;
    file.flush()
}

impl Drop for LockGuard {
    // Release the lock automatically when the guard goes out of scope.
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
