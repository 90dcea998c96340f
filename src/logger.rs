//! Log pipeline: rotating file sinks, AUTO child logs, and the activity log.
//!
//! Every sink is a [`LogFile`]: created lazily on first write, rotated by a
//! rename chain (`name` -> `name.1` -> ... -> `name.N`) when a size threshold
//! is crossed, and cleared on operator request. The supervisor's own activity
//! log is the same sink behind the `tracing` subscriber.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use tracing_subscriber::fmt::MakeWriter;

/// Marker suffix for supervisor-chosen child logs, used by startup cleanup.
pub const AUTO_SUFFIX: &str = "---taskmaster.log";

/// A rotating log sink.
///
/// `maxbytes == 0` disables rotation; `backups == 0` keeps every rotated
/// file. Only one writer ever holds the handle, and rotation is a rename
/// chain, so a concurrent reader sees either the old file or the new one.
#[derive(Debug)]
pub struct LogFile {
    path: PathBuf,
    maxbytes: u64,
    backups: u32,
    file: Option<File>,
    written: u64,
}

impl LogFile {
    /// Creates a sink; the file itself is not opened until the first write.
    pub fn new(path: PathBuf, maxbytes: u64, backups: u32) -> Self {
        LogFile {
            path,
            maxbytes,
            backups,
            file: None,
            written: 0,
        }
    }

    /// Path of the live log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the live file in bytes.
    pub fn size(&mut self) -> u64 {
        if self.file.is_none() {
            self.written = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        }
        self.written
    }

    fn ensure_open(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.written = file.metadata()?.len();
            self.file = Some(file);
        }
        Ok(self.file.as_mut().unwrap_or_else(|| unreachable!()))
    }

    /// Appends bytes, rotating at the threshold boundary so the live file
    /// never exceeds `maxbytes`.
    pub fn write_all(&mut self, mut bytes: &[u8]) -> io::Result<()> {
        while !bytes.is_empty() {
            self.ensure_open()?;
            let chunk = if self.maxbytes > 0 {
                if self.written >= self.maxbytes {
                    self.rotate()?;
                    continue;
                }
                let space = (self.maxbytes - self.written) as usize;
                bytes.len().min(space)
            } else {
                bytes.len()
            };

            let file = self.ensure_open()?;
            file.write_all(&bytes[..chunk])?;
            self.written += chunk as u64;
            bytes = &bytes[chunk..];
        }
        Ok(())
    }

    /// Rotates the rename chain and reopens a fresh live file. A no-op when
    /// nothing has ever been written and the file does not exist.
    pub fn rotate(&mut self) -> io::Result<()> {
        if self.file.is_none() && !self.path.exists() {
            return Ok(());
        }
        self.file = None;

        let upper = if self.backups > 0 {
            self.backups
        } else {
            // Unbounded: shift every existing numbered backup up by one.
            let mut n = 1;
            while self.backup_path(n).exists() {
                n += 1;
            }
            n
        };

        for i in (1..upper).rev() {
            let from = self.backup_path(i);
            if from.exists() {
                fs::rename(&from, self.backup_path(i + 1))?;
            }
        }
        if upper >= 1 {
            fs::rename(&self.path, self.backup_path(1))?;
        }
        self.written = 0;
        Ok(())
    }

    /// Truncates the live file and deletes every numbered backup.
    pub fn clear(&mut self) -> io::Result<()> {
        self.file = None;
        self.written = 0;
        if self.path.exists() {
            File::create(&self.path)?;
        }
        let mut n = 1;
        loop {
            let backup = self.backup_path(n);
            if !backup.exists() {
                break;
            }
            fs::remove_file(&backup)?;
            n += 1;
        }
        Ok(())
    }

    /// Reads up to `length` bytes starting at `offset`.
    ///
    /// A negative offset counts back from the end of the file; `length == 0`
    /// reads through EOF.
    pub fn read_chunk(&mut self, offset: i64, length: u64) -> io::Result<Vec<u8>> {
        let size = self.size();
        let start = if offset < 0 {
            size.saturating_sub(offset.unsigned_abs())
        } else {
            (offset as u64).min(size)
        };
        let end = if length == 0 {
            size
        } else {
            (start + length).min(size)
        };
        self.read_range(start, end)
    }

    /// Tail semantics for endpoint-relative readers: returns the bytes in
    /// `[max(offset, size - length), size)`, the new endpoint offset, and an
    /// overflow flag set when bytes were skipped.
    pub fn tail_chunk(&mut self, offset: u64, length: u64) -> io::Result<(Vec<u8>, u64, bool)> {
        let size = self.size();
        let (start, overflow) = if size > offset + length {
            (size - length, true)
        } else {
            (offset.min(size), false)
        };
        let data = self.read_range(start, size)?;
        Ok((data, size, overflow))
    }

    fn read_range(&self, start: u64, end: u64) -> io::Result<Vec<u8>> {
        if end <= start || !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn backup_path(&self, n: u32) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }
}

/// Returns the supervisor-chosen path for a program's AUTO log.
pub fn auto_log_path(childlogdir: &Path, program: &str) -> PathBuf {
    childlogdir.join(format!("{program}{AUTO_SUFFIX}"))
}

/// Deletes stale AUTO logs (and their rotated backups) from `childlogdir`.
pub fn cleanup_auto_logs(childlogdir: &Path) -> io::Result<()> {
    let entries = match fs::read_dir(childlogdir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str())
            && name.contains(AUTO_SUFFIX)
        {
            let _ = fs::remove_file(&path);
        }
    }
    Ok(())
}

/// Shared handle to the supervisor's activity log.
///
/// Cloned into the `tracing` subscriber as its writer and held by the
/// supervisor for rotation and the `readLog`/`clearLog` control calls.
#[derive(Clone)]
pub struct ActivityLog {
    sink: Arc<Mutex<LogFile>>,
    echo_stderr: bool,
}

impl ActivityLog {
    /// Creates the activity log; `echo_stderr` additionally copies output to
    /// stderr (foreground mode).
    pub fn new(path: PathBuf, maxbytes: u64, backups: u32, echo_stderr: bool) -> Self {
        ActivityLog {
            sink: Arc::new(Mutex::new(LogFile::new(path, maxbytes, backups))),
            echo_stderr,
        }
    }

    fn with_sink<T>(&self, f: impl FnOnce(&mut LogFile) -> T) -> T {
        let mut guard = match self.sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Forces rotation regardless of size.
    pub fn rotate(&self) -> io::Result<()> {
        self.with_sink(|sink| sink.rotate())
    }

    /// Truncates the log and removes backups.
    pub fn clear(&self) -> io::Result<()> {
        self.with_sink(|sink| sink.clear())
    }

    /// Reads a chunk with `readLog` semantics.
    pub fn read_chunk(&self, offset: i64, length: u64) -> io::Result<Vec<u8>> {
        self.with_sink(|sink| sink.read_chunk(offset, length))
    }
}

/// Per-event writer handed out to the subscriber.
pub struct ActivityWriter {
    log: ActivityLog,
}

impl Write for ActivityWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.log.with_sink(|sink| sink.write_all(buf))?;
        if self.log.echo_stderr {
            let _ = io::stderr().write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for ActivityLog {
    type Writer = ActivityWriter;

    fn make_writer(&'a self) -> Self::Writer {
        ActivityWriter { log: self.clone() }
    }
}
