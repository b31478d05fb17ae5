use log::{debug, error};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Lines, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crate::{DfsError, DfsResult};

/// Line-oriented append-only record log. Each record is one compact JSON line.
pub struct AppendLog {
    path: PathBuf,
    file: File,
}

impl AppendLog {
    /// Open `path` for appending, creating it if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> DfsResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                error!("append log: open {} failed: {}", path.display(), e);
                DfsError::from(e)
            })?;
        Ok(Self { path, file })
    }

    /// Handle that refuses every append; lets tests drive the journal failure path.
    #[cfg(test)]
    pub(crate) fn open_read_only(path: impl AsRef<Path>) -> DfsResult<Self> {
        let path = path.as_ref().to_path_buf();
        OpenOptions::new().create(true).append(true).open(&path)?;
        let file = File::open(&path)?;
        Ok(Self { path, file })
    }

    /// Write one record and flush it to stable storage before returning.
    pub fn append<T: Serialize>(&mut self, record: &T) -> DfsResult<()> {
        let mut line = serde_json::to_vec(record)
            .map_err(|e| DfsError::DecodeError(format!("encode log record: {}", e)))?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Re-open the file and iterate every record currently on disk.
    pub fn replay<T: DeserializeOwned>(&self) -> DfsResult<LogRecords<T>> {
        replay_file(&self.path)
    }
}

/// Lazily decoded records of a log file. Blank lines are skipped.
pub struct LogRecords<T> {
    lines: Option<Lines<BufReader<File>>>,
    line_no: usize,
    _marker: PhantomData<T>,
}

impl<T: DeserializeOwned> Iterator for LogRecords<T> {
    type Item = DfsResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let lines = self.lines.as_mut()?;
        loop {
            let line = match lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(DfsError::from(e))),
            };
            self.line_no += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return Some(serde_json::from_str(line).map_err(|e| {
                DfsError::DecodeError(format!("log line {}: {}", self.line_no, e))
            }));
        }
    }
}

/// Iterate the records of `path`. A missing file yields an empty sequence.
pub fn replay_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> DfsResult<LogRecords<T>> {
    let path = path.as_ref();
    let lines = if path.exists() {
        Some(BufReader::new(File::open(path)?).lines())
    } else {
        debug!("append log: {} not exists, nothing to replay", path.display());
        None
    };
    Ok(LogRecords {
        lines,
        line_no: 0,
        _marker: PhantomData,
    })
}

/// Write a whole log in one pass (truncating any previous content) and sync once at the end.
pub fn write_records<T, I>(path: impl AsRef<Path>, records: I) -> DfsResult<usize>
where
    T: Serialize,
    I: IntoIterator<Item = T>,
{
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    let mut count = 0usize;
    for record in records {
        serde_json::to_writer(&mut writer, &record)
            .map_err(|e| DfsError::DecodeError(format!("encode log record: {}", e)))?;
        writer.write_all(b"\n")?;
        count += 1;
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(count)
}

/// Random access reader over a log: offsets of every record keyed by 1-based sequence number.
pub struct IndexedLog {
    path: PathBuf,
    offsets: Vec<u64>,
}

impl IndexedLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            offsets: Vec::new(),
        }
    }

    /// Scan the file once and remember where each non-blank record starts.
    pub fn build_index(&mut self) -> DfsResult<usize> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut offsets = Vec::new();
        let mut pos = 0u64;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 {
                break;
            }
            if buf.iter().any(|b| !b.is_ascii_whitespace()) {
                offsets.push(pos);
            }
            pos += n as u64;
        }
        self.offsets = offsets;
        Ok(self.offsets.len())
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Read record `seq` (1-based). `None` if `seq` is outside the index.
    pub fn read_at<T: DeserializeOwned>(&self, seq: usize) -> DfsResult<Option<T>> {
        let Some(offset) = seq.checked_sub(1).and_then(|i| self.offsets.get(i)).copied() else {
            return Ok(None);
        };
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut line = String::new();
        BufReader::new(file).read_line(&mut line)?;
        let record = serde_json::from_str(line.trim())
            .map_err(|e| DfsError::DecodeError(format!("log record {}: {}", seq, e)))?;
        Ok(Some(record))
    }
}
