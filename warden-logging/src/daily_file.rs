//! Per-worker log files rotated by day and by size
//!
//! Files are named `<name>_<YYYY-MM-DD>.log`. Once a day's file reaches
//! `max_file_bytes`, output for that day continues in
//! `<name>_<YYYY-MM-DD>.<n>.log`. Files of the same worker whose date is more
//! than `retention_days` old are deleted whenever a file is opened.

use chrono::{Days, Local, NaiveDate};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_FILE_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_RETENTION_DAYS: u32 = 7;

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATE_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_file_bytes: u64,
    pub retention_days: u32,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

#[derive(Debug)]
struct ActiveFile {
    date: NaiveDate,
    index: u32,
    file: File,
    written: u64,
}

/// `io::Write` sink for one worker's log output
#[derive(Debug)]
pub struct DailyFileWriter {
    dir: PathBuf,
    name: String,
    policy: RotationPolicy,
    active: Option<ActiveFile>,
}

impl DailyFileWriter {
    /// Create `dir` if needed and open today's file
    pub fn open(
        dir: impl Into<PathBuf>,
        name: impl Into<String>,
        policy: RotationPolicy,
    ) -> io::Result<Self> {
        Self::open_on(dir.into(), name.into(), policy, Local::now().date_naive())
    }

    fn open_on(
        dir: PathBuf,
        name: String,
        policy: RotationPolicy,
        date: NaiveDate,
    ) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let mut writer = Self {
            dir,
            name,
            policy,
            active: None,
        };
        writer.roll_to(date, 0)?;
        Ok(writer)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(&self, date: NaiveDate, index: u32) -> String {
        let date = date.format(DATE_FORMAT);
        if index == 0 {
            format!("{}_{}.log", self.name, date)
        } else {
            format!("{}_{}.{}.log", self.name, date, index)
        }
    }

    /// File currently receiving output
    pub fn current_path(&self) -> Option<PathBuf> {
        self.active
            .as_ref()
            .map(|active| self.dir.join(self.file_name(active.date, active.index)))
    }

    /// Open the first file for `date` at or after `start_index` that still has room
    fn roll_to(&mut self, date: NaiveDate, start_index: u32) -> io::Result<()> {
        if let Some(mut previous) = self.active.take() {
            previous.file.flush()?;
        }

        let mut index = start_index;
        loop {
            let path = self.dir.join(self.file_name(date, index));
            let existing = match fs::metadata(&path) {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
                Err(e) => return Err(e),
            };

            if existing < self.policy.max_file_bytes {
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                self.active = Some(ActiveFile {
                    date,
                    index,
                    file,
                    written: existing,
                });
                break;
            }
            index += 1;
        }

        self.prune(date)?;
        Ok(())
    }

    /// Delete this worker's files dated before the retention window
    fn prune(&self, today: NaiveDate) -> io::Result<usize> {
        let Some(cutoff) = today.checked_sub_days(Days::new(self.policy.retention_days.into()))
        else {
            return Ok(0);
        };

        let prefix = format!("{}_", self.name);
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(date) = parse_log_date(file_name, &prefix) else {
                continue;
            };
            // A file another process already removed is fine
            if date < cutoff && fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn write_on(&mut self, date: NaiveDate, buf: &[u8]) -> io::Result<usize> {
        let next_index = match &self.active {
            None => Some(0),
            Some(active) if active.date != date => Some(0),
            Some(active) if active.written >= self.policy.max_file_bytes => Some(active.index + 1),
            Some(_) => None,
        };
        if let Some(index) = next_index {
            self.roll_to(date, index)?;
        }

        let active = self
            .active
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no log file open"))?;
        let written = active.file.write(buf)?;
        active.written += written as u64;
        Ok(written)
    }
}

impl Write for DailyFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_on(Local::now().date_naive(), buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.active.as_mut() {
            Some(active) => active.file.flush(),
            None => Ok(()),
        }
    }
}

/// Date of a `<prefix><date>.log` or `<prefix><date>.<n>.log` file name
fn parse_log_date(file_name: &str, prefix: &str) -> Option<NaiveDate> {
    let rest = file_name.strip_prefix(prefix)?;
    let date = rest.get(..DATE_LEN)?;
    let tail = rest.get(DATE_LEN..)?;

    let tail_ok = match tail.strip_suffix(".log")? {
        "" => true,
        index => index
            .strip_prefix('.')
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit())),
    };
    if !tail_ok {
        return None;
    }
    NaiveDate::parse_from_str(date, DATE_FORMAT).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FORMAT).unwrap()
    }

    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_parse_log_date() {
        assert_eq!(parse_log_date("seller_2024-05-01.log", "seller_"), Some(date("2024-05-01")));
        assert_eq!(parse_log_date("seller_2024-05-01.3.log", "seller_"), Some(date("2024-05-01")));
        assert_eq!(parse_log_date("seller_x_2024-05-01.log", "seller_"), None);
        assert_eq!(parse_log_date("seller_2024-05-01.txt", "seller_"), None);
        assert_eq!(parse_log_date("seller_2024-05-01..log", "seller_"), None);
        assert_eq!(parse_log_date("buyer_2024-05-01.log", "seller_"), None);
        assert_eq!(parse_log_date("seller_é", "seller_"), None);
    }

    #[test]
    fn test_opens_dated_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DailyFileWriter::open_on(
            dir.path().join("logs"),
            "scanner".into(),
            RotationPolicy::default(),
            date("2024-05-01"),
        )
        .unwrap();

        writer.write_on(date("2024-05-01"), b"hello\n").unwrap();
        writer.flush().unwrap();

        let path = dir.path().join("logs/scanner_2024-05-01.log");
        assert_eq!(writer.current_path(), Some(path.clone()));
        assert_eq!(fs::read_to_string(path).unwrap(), "hello\n");
    }

    #[test]
    fn test_size_overflow_moves_to_numbered_file() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RotationPolicy {
            max_file_bytes: 10,
            retention_days: 7,
        };
        let day = date("2024-05-01");
        let mut writer =
            DailyFileWriter::open_on(dir.path().into(), "w".into(), policy, day).unwrap();

        writer.write_on(day, b"0123456789").unwrap();
        writer.write_on(day, b"abc").unwrap();
        writer.write_on(day, b"defghijk").unwrap();
        writer.write_on(day, b"z").unwrap();
        writer.flush().unwrap();

        assert_eq!(
            names(dir.path()),
            ["w_2024-05-01.1.log", "w_2024-05-01.2.log", "w_2024-05-01.log"]
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("w_2024-05-01.1.log")).unwrap(),
            "abcdefghijk"
        );

        // A restart the same day skips the full files
        drop(writer);
        let writer = DailyFileWriter::open_on(dir.path().into(), "w".into(), policy, day).unwrap();
        assert_eq!(
            writer.current_path(),
            Some(dir.path().join("w_2024-05-01.2.log"))
        );
    }

    #[test]
    fn test_date_change_starts_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DailyFileWriter::open_on(
            dir.path().into(),
            "w".into(),
            RotationPolicy::default(),
            date("2024-05-01"),
        )
        .unwrap();

        writer.write_on(date("2024-05-01"), b"one\n").unwrap();
        writer.write_on(date("2024-05-02"), b"two\n").unwrap();

        assert_eq!(names(dir.path()), ["w_2024-05-01.log", "w_2024-05-02.log"]);
        assert_eq!(
            fs::read_to_string(dir.path().join("w_2024-05-02.log")).unwrap(),
            "two\n"
        );
    }

    #[test]
    fn test_old_files_of_same_worker_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "w_2024-04-20.log",
            "w_2024-04-20.1.log",
            "w_2024-05-03.log",
            "w_2024-05-05.log",
            "other_2024-04-01.log",
            "w_notes.txt",
        ] {
            fs::write(dir.path().join(name), "x").unwrap();
        }

        DailyFileWriter::open_on(
            dir.path().into(),
            "w".into(),
            RotationPolicy::default(),
            date("2024-05-10"),
        )
        .unwrap();

        assert_eq!(
            names(dir.path()),
            [
                "other_2024-04-01.log",
                "w_2024-05-03.log",
                "w_2024-05-05.log",
                "w_2024-05-10.log",
                "w_notes.txt",
            ]
        );
    }
}
