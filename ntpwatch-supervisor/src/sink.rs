/**
 * OUTPUT SINK - Hour-partitioned CSV file shared by every sampler
 *
 * ROLE: single serialized append point. Every row is written and flushed
 * under one lock, so rows never interleave. When the local wall-clock hour
 * changes between two writes the current file is closed and a new one opened;
 * the row that triggered the rotation lands in the new file.
 *
 * FILE NAME: <base_dir>/<run_id>.<YYYYMMDDHHmm>.csv (minute the file was opened)
 */

use chrono::{Local, NaiveDateTime, Timelike};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::identity::ServerIdentity;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("can't open output file {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("can't write to output file {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Wall clock seen by the sink, in local time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// One output row.
#[derive(Debug, Clone, Copy)]
pub struct SampleRecord<'a> {
    pub identity: &'a ServerIdentity,
    pub raw: &'a str,
}

impl SampleRecord<'_> {
    pub fn to_row(&self) -> String {
        format_row(&self.identity.address().to_string(), self.raw, &self.identity.csv_suffix())
    }
}

fn format_row(source: &str, raw: &str, suffix: &str) -> String {
    format!("{source},{raw},{suffix}")
}

/// Hour bucket of a timestamp: the date plus the hour of day.
fn hour_bucket(now: &NaiveDateTime) -> (chrono::NaiveDate, u32) {
    (now.date(), now.hour())
}

struct OpenFile {
    path: PathBuf,
    writer: BufWriter<File>,
    bucket: (chrono::NaiveDate, u32),
}

pub struct OutputSink {
    base_dir: PathBuf,
    run_id: String,
    clock: Arc<dyn Clock>,
    current: Mutex<Option<OpenFile>>,
}

impl OutputSink {
    pub fn new<P: Into<PathBuf>>(base_dir: P, run_id: impl Into<String>) -> Self {
        Self::with_clock(base_dir, run_id, Arc::new(SystemClock))
    }

    pub fn with_clock<P: Into<PathBuf>>(base_dir: P, run_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            base_dir: base_dir.into(),
            run_id: run_id.into(),
            clock,
            current: Mutex::new(None),
        }
    }

    /// File name for output opened at `now`.
    pub fn file_path_for(&self, now: &NaiveDateTime) -> PathBuf {
        self.base_dir
            .join(format!("{}.{}.csv", self.run_id, now.format("%Y%m%d%H%M")))
    }

    pub fn current_path(&self) -> Option<PathBuf> {
        self.current.lock().as_ref().map(|f| f.path.clone())
    }

    pub fn write_record(&self, record: &SampleRecord<'_>) -> Result<(), SinkError> {
        self.write_row(record.to_row())
    }

    /// Appends `source,raw,suffix` to the file of the current hour and flushes.
    pub fn write(&self, source: &str, raw: &str, suffix: &str) -> Result<(), SinkError> {
        self.write_row(format_row(source, raw, suffix))
    }

    // Blocking std::fs append + flush, called straight from sampler tasks.
    // One short write per row; move to spawn_blocking if rows get large or frequent.
    fn write_row(&self, mut row: String) -> Result<(), SinkError> {
        let mut current = self.current.lock();
        let now = self.clock.now();
        let bucket = hour_bucket(&now);

        let mut open = match current.take() {
            Some(open) if open.bucket == bucket => open,
            previous => {
                if let Some(mut old) = previous {
                    if let Err(e) = old.writer.flush() {
                        warn!("flush of {} failed on rotation: {e}", old.path.display());
                    }
                }
                self.open_file(&now)?
            }
        };

        row.push('\n');
        let written = open
            .writer
            .write_all(row.as_bytes())
            .and_then(|_| open.writer.flush())
            .map_err(|source| SinkError::Write { path: open.path.clone(), source });
        *current = Some(open);
        written
    }

    fn open_file(&self, now: &NaiveDateTime) -> Result<OpenFile, SinkError> {
        let path = self.file_path_for(now);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| SinkError::Open { path: path.clone(), source })?;
        info!("Writing to file: {}", path.display());
        Ok(OpenFile { path, writer: BufWriter::new(file), bucket: hour_bucket(now) })
    }

    /// Flushes and closes the open file, if any.
    pub fn close(&self) -> Result<(), SinkError> {
        if let Some(mut open) = self.current.lock().take() {
            open.writer
                .flush()
                .map_err(|source| SinkError::Write { path: open.path.clone(), source })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::path::Path;

    /// Clock returning a settable instant.
    struct FixedClock(Mutex<NaiveDateTime>);

    impl FixedClock {
        fn at(h: u32, m: u32, s: u32) -> Arc<Self> {
            Arc::new(Self(Mutex::new(stamp(h, m, s))))
        }

        fn set(&self, h: u32, m: u32, s: u32) {
            *self.0.lock() = stamp(h, m, s);
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> NaiveDateTime {
            *self.0.lock()
        }
    }

    fn stamp(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9).unwrap().and_hms_opt(h, m, s).unwrap()
    }

    fn lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path).unwrap().lines().map(String::from).collect()
    }

    #[test]
    fn test_rotation_on_hour_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let clock = FixedClock::at(13, 59, 58);
        let sink = OutputSink::with_clock(dir.path(), "run", clock.clone());

        sink.write("10.0.0.5", "first", "alpha,10.0.0.5,alpha.example").unwrap();
        let first = sink.current_path().unwrap();
        assert_eq!(first, dir.path().join("run.202403091359.csv"));

        clock.set(14, 0, 2);
        sink.write("10.0.0.5", "second", "alpha,10.0.0.5,alpha.example").unwrap();
        let second = sink.current_path().unwrap();
        assert_eq!(second, dir.path().join("run.202403091400.csv"));

        assert_eq!(lines(&first), vec!["10.0.0.5,first,alpha,10.0.0.5,alpha.example"]);
        assert_eq!(lines(&second), vec!["10.0.0.5,second,alpha,10.0.0.5,alpha.example"]);
    }

    #[test]
    fn test_no_rotation_within_hour() {
        let dir = tempfile::tempdir().unwrap();
        let clock = FixedClock::at(9, 1, 0);
        let sink = OutputSink::with_clock(dir.path(), "run", clock.clone());

        sink.write("a", "1", "s").unwrap();
        clock.set(9, 59, 59);
        sink.write("a", "2", "s").unwrap();

        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
        assert_eq!(lines(&sink.current_path().unwrap()), vec!["a,1,s", "a,2,s"]);
    }

    #[test]
    fn test_record_row_format() {
        let identity = ServerIdentity::new("alpha", "10.0.0.5".parse().unwrap(), "alpha.example");
        let record = SampleRecord { identity: &identity, raw: "offset=0.001" };
        assert_eq!(record.to_row(), "10.0.0.5,offset=0.001,alpha,10.0.0.5,alpha.example");

        let dir = tempfile::tempdir().unwrap();
        let sink = OutputSink::with_clock(dir.path(), "run", FixedClock::at(10, 0, 0));
        sink.write_record(&record).unwrap();
        assert_eq!(lines(&sink.current_path().unwrap()), vec![record.to_row()]);
    }

    #[test]
    fn test_open_failure_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not-yet");
        let sink = OutputSink::with_clock(&missing, "run", FixedClock::at(8, 0, 0));

        assert!(matches!(sink.write("a", "1", "s"), Err(SinkError::Open { .. })));
        assert!(sink.current_path().is_none());

        std::fs::create_dir(&missing).unwrap();
        sink.write("a", "2", "s").unwrap();
        assert_eq!(lines(&sink.current_path().unwrap()), vec!["a,2,s"]);
    }

    #[test]
    fn test_concurrent_writers_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(OutputSink::with_clock(dir.path(), "run", FixedClock::at(10, 0, 0)));

        let handles: Vec<_> = (0..8)
            .map(|w| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        sink.write(&format!("w{w}"), &format!("sample-{i}"), "x,y,z").unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        sink.close().unwrap();

        let rows = lines(&dir.path().join("run.202403091000.csv"));
        assert_eq!(rows.len(), 8 * 200);
        for w in 0..8 {
            let prefix = format!("w{w},");
            let own: Vec<_> = rows.iter().filter(|r| r.starts_with(&prefix)).collect();
            assert_eq!(own.len(), 200);
            for (i, row) in own.iter().enumerate() {
                assert_eq!(**row, format!("w{w},sample-{i},x,y,z"));
            }
        }
    }
}
