//! Size-rotated log file
//!
//! `app.log` rolls to `app.log.1` (older backups shift up by one) once the
//! next record would push it past the size cap. Rotation happens between
//! records, so a record is never split across files.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;

/// `app.log` -> `app.log.<n>`
fn backup_path(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}", n));
    PathBuf::from(name)
}

/// Move `path` to `path.1`, shifting older backups up and dropping the oldest
fn shift_backups(path: &Path, backups: usize) -> io::Result<()> {
    if backups == 0 {
        return match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        };
    }

    let oldest = backup_path(path, backups);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for n in (1..backups).rev() {
        let from = backup_path(path, n);
        if from.exists() {
            fs::rename(&from, backup_path(path, n + 1))?;
        }
    }
    fs::rename(path, backup_path(path, 1))
}

/// Rotate `path` if it already exceeds `max_bytes`
fn rotate_log_file(path: &Path, max_bytes: u64, backups: usize) -> io::Result<()> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() > max_bytes => shift_backups(path, backups),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

struct ActiveFile {
    file: File,
    written: u64,
}

/// Log file that rotates itself once it reaches `max_bytes`
pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    active: Mutex<ActiveFile>,
}

impl RotatingFile {
    /// Open `path` for appending, creating its directory. A file left over
    /// past the cap from an earlier run is rotated first.
    pub fn open(path: &Path, max_bytes: u64, backups: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        rotate_log_file(path, max_bytes, backups)?;
        let file = open_append(path)?;
        let written = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            max_bytes,
            backups,
            active: Mutex::new(ActiveFile { file, written }),
        })
    }

    fn roll(&self, active: &mut ActiveFile) -> io::Result<()> {
        active.file.flush()?;
        shift_backups(&self.path, self.backups)?;
        active.file = open_append(&self.path)?;
        active.written = 0;
        Ok(())
    }

    fn write_record(&self, buf: &[u8]) -> io::Result<()> {
        let mut active = self.active.lock();
        let len = buf.len() as u64;
        if active.written > 0 && active.written + len > self.max_bytes {
            if let Err(e) = self.roll(&mut active) {
                // Keep logging to the current file rather than losing records
                eprintln!("portmapd: failed to rotate {:?}: {}", self.path, e);
            }
        }
        active.file.write_all(buf)?;
        active.written += len;
        Ok(())
    }
}

/// Per-event handle returned by [`RotatingFile`]'s `MakeWriter` impl
pub struct RotatingFileWriter<'a>(&'a RotatingFile);

impl Write for RotatingFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_record(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.active.lock().file.flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingFile {
    type Writer = RotatingFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingFileWriter(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_bytes(path: &Path, len: usize) {
        fs::write(path, vec![b'x'; len]).unwrap();
    }

    fn len(path: &Path) -> u64 {
        fs::metadata(path).unwrap().len()
    }

    #[test]
    fn test_rotate_small_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("portmapping.log");
        write_bytes(&log, 10);

        rotate_log_file(&log, 100, 5).unwrap();
        assert!(log.exists());
        assert!(!backup_path(&log, 1).exists());

        // Missing file is fine
        rotate_log_file(&dir.path().join("absent.log"), 100, 5).unwrap();
    }

    #[test]
    fn test_rotate_shifts_backups() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("portmapping.log");
        write_bytes(&backup_path(&log, 1), 1);
        write_bytes(&backup_path(&log, 2), 2);
        write_bytes(&log, 200);

        rotate_log_file(&log, 100, 2).unwrap();
        assert!(!log.exists());
        assert_eq!(len(&backup_path(&log, 1)), 200);
        assert_eq!(len(&backup_path(&log, 2)), 1);
        assert!(!backup_path(&log, 3).exists());
    }

    #[test]
    fn test_open_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs").join("portmapping.log");
        RotatingFile::open(&log, 100, 5).unwrap();
        assert!(log.exists());
    }

    #[test]
    fn test_rolls_over_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("portmapping.log");
        let file = RotatingFile::open(&log, 100, 2).unwrap();

        let record = [b'a'; 60];
        file.make_writer().write_all(&record).unwrap();
        assert!(!backup_path(&log, 1).exists());

        file.make_writer().write_all(&record).unwrap();
        assert_eq!(len(&backup_path(&log, 1)), 60);
        assert_eq!(len(&log), 60);

        file.make_writer().write_all(&record).unwrap();
        file.make_writer().write_all(&record).unwrap();
        assert_eq!(len(&backup_path(&log, 2)), 60);
        assert!(!backup_path(&log, 3).exists());
    }

    #[test]
    fn test_oversized_record_is_written_whole() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("portmapping.log");
        let file = RotatingFile::open(&log, 10, 1).unwrap();

        file.make_writer().write_all(&[b'b'; 50]).unwrap();
        assert_eq!(len(&log), 50);
        assert!(!backup_path(&log, 1).exists());
    }

    #[test]
    fn test_counts_bytes_from_earlier_run() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("portmapping.log");
        write_bytes(&log, 80);

        let file = RotatingFile::open(&log, 100, 1).unwrap();
        file.make_writer().write_all(&[b'c'; 30]).unwrap();
        assert_eq!(len(&backup_path(&log, 1)), 80);
        assert_eq!(len(&log), 30);
    }
}
