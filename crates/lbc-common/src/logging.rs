//! Process logging context.
//!
//! Console output plus a size-rotating log file. The file layer always
//! records this tool's crates at debug level, so every HTTP request and
//! every readiness probe attempt ends up on disk even when the console is
//! kept at info.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

pub const LOG_FILE_NAME: &str = "oci-lb-certbot.log";
/// Rotation threshold for the log file
pub const MAX_LOG_BYTES: u64 = 5 * 1024 * 1024;
/// Number of rotated files kept next to the active one
pub const LOG_BACKUPS: usize = 5;

const FILE_DIRECTIVES: &str =
    "info,lbc_common=debug,lbc_responder=debug,lbc_acme=debug,oci_lb_certbot=debug";

#[derive(Debug, Clone, Default)]
pub struct LogSettings {
    /// Directory for the rotating file; `None` logs to the console only
    pub dir: Option<PathBuf>,
    /// Raise the console to debug
    pub verbose: bool,
}

/// Owns the background log writer. Dropping it flushes the file.
pub struct LogContext {
    _guard: Option<WorkerGuard>,
    file_path: Option<PathBuf>,
}

impl LogContext {
    /// Install the global subscriber. Must run before the responder or the
    /// prober start.
    pub fn init(settings: &LogSettings) -> anyhow::Result<Self> {
        let console_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if settings.verbose {
                EnvFilter::new(FILE_DIRECTIVES)
            } else {
                EnvFilter::new("info")
            }
        });
        let console = fmt::layer().with_target(false).with_filter(console_filter);

        let mut open_error = None;
        let mut guard = None;
        let mut file_path = None;
        let mut file_layer = None;

        if let Some(dir) = &settings.dir {
            let path = dir.join(LOG_FILE_NAME);
            match std::fs::create_dir_all(dir)
                .and_then(|_| RotatingFile::open(&path, MAX_LOG_BYTES, LOG_BACKUPS))
            {
                Ok(writer) => {
                    let (non_blocking, g) = tracing_appender::non_blocking(writer);
                    guard = Some(g);
                    file_path = Some(path);
                    file_layer = Some(
                        fmt::layer()
                            .with_ansi(false)
                            .with_writer(non_blocking)
                            .with_filter(EnvFilter::new(FILE_DIRECTIVES)),
                    );
                }
                Err(e) => open_error = Some((path, e)),
            }
        }

        tracing_subscriber::registry()
            .with(console)
            .with(file_layer)
            .try_init()?;

        if let Some((path, e)) = open_error {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Cannot open log file, logging to console only"
            );
        }

        Ok(Self {
            _guard: guard,
            file_path,
        })
    }

    /// Path of the active log file, if file logging is enabled
    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    /// Flush pending lines and release the file
    pub fn shutdown(self) {
        drop(self);
    }
}

/// Append-only file that rotates once it grows past `max_bytes`.
///
/// Backups are numbered `<name>.1` (newest) to `<name>.<backups>` (oldest).
pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    file: File,
    written: u64,
}

impl RotatingFile {
    pub fn open(path: &Path, max_bytes: u64, backups: usize) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            max_bytes,
            backups,
            file,
            written,
        })
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        if self.backups > 0 {
            for index in (1..self.backups).rev() {
                let from = self.backup_path(index);
                if from.exists() {
                    std::fs::rename(&from, self.backup_path(index + 1))?;
                }
            }
            std::fs::rename(&self.path, self.backup_path(1))?;
        }

        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_keeps_bounded_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        let mut file = RotatingFile::open(&path, 10, 2).unwrap();

        for _ in 0..5 {
            file.write_all(b"0123456789").unwrap();
        }
        file.flush().unwrap();

        assert!(path.exists());
        assert!(dir.path().join("test.log.1").exists());
        assert!(dir.path().join("test.log.2").exists());
        assert!(!dir.path().join("test.log.3").exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"0123456789");
    }

    #[test]
    fn test_no_rotation_below_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.log");
        let mut file = RotatingFile::open(&path, 1024, 3).unwrap();

        file.write_all(b"first line\n").unwrap();
        file.write_all(b"second line\n").unwrap();
        file.flush().unwrap();

        assert!(!dir.path().join("small.log.1").exists());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "first line\nsecond line\n"
        );
    }

    #[test]
    fn test_reopen_counts_existing_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reopen.log");
        std::fs::write(&path, b"12345678").unwrap();

        let mut file = RotatingFile::open(&path, 10, 1).unwrap();
        file.write_all(b"abcdef").unwrap();
        file.flush().unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("reopen.log.1")).unwrap(),
            b"12345678"
        );
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
    }

    #[test]
    fn test_zero_backups_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nobackup.log");
        let mut file = RotatingFile::open(&path, 4, 0).unwrap();

        file.write_all(b"aaaa").unwrap();
        file.write_all(b"bbbb").unwrap();
        file.flush().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"bbbb");
        assert!(!dir.path().join("nobackup.log.1").exists());
    }
}
