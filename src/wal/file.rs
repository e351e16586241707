//! WAL file + directory management and recovery: a `Mutex<BufWriter<File>>`
//! handle with vectored writes and fsync, directory scanning on open, and
//! fixed `<firstLogId>.wal` naming with backward-scan recovery to find the
//! real end of a file interrupted mid-append.

use crate::error::{RaftError, Result};
use crate::ids::{LogId, TermId};
use crate::wal::record::LogEntry;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, IoSlice, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Per-file info record tracked alongside each `<firstLogId>.wal` file.
#[derive(Debug, Clone)]
pub struct WalFileInfo {
    pub fullname: PathBuf,
    pub first_log_id: LogId,
    pub last_log_id: LogId,
    pub mtime: SystemTime,
    pub size: u64,
}

fn file_name_for(first_log_id: LogId) -> String {
    format!("{}.wal", first_log_id)
}

/// Owns the on-disk side of one WAL directory: the file index, the
/// currently-open append file, and rotation/recovery/rollback mechanics.
/// Append is not thread-safe by design; callers serialize.
pub struct WalFileSet {
    dir: PathBuf,
    files: Vec<WalFileInfo>,
    current: Option<BufWriter<File>>,
    last_log_term: TermId,
}

impl WalFileSet {
    /// Open (or create) `dir`, scanning existing files and recovering a
    /// torn write at the tail of the last file.
    pub fn open(dir: &Path) -> Result<(Self, Vec<LogEntry>)> {
        fs::create_dir_all(dir)?;
        let mut files = Self::scan_all_wal_files(dir)?;
        files.sort_by_key(|f| f.first_log_id);

        let mut recovered = Vec::new();
        let mut last_log_term = 0;
        if let Some(last) = files.last_mut() {
            let (valid_size, entries) = Self::recover_tail(&last.fullname)?;
            if valid_size != last.size {
                let f = OpenOptions::new().write(true).open(&last.fullname)?;
                f.set_len(valid_size)?;
                last.size = valid_size;
            }
            if let Some(e) = entries.last() {
                last.last_log_id = e.log_id;
                last_log_term = e.term;
            }
            recovered = entries;
        }

        let current = if let Some(last) = files.last() {
            Some(BufWriter::new(
                OpenOptions::new().append(true).open(&last.fullname)?,
            ))
        } else {
            None
        };

        Ok((
            WalFileSet { dir: dir.to_path_buf(), files, current, last_log_term },
            recovered,
        ))
    }

    fn scan_all_wal_files(dir: &Path) -> Result<Vec<WalFileInfo>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            let Some(ext) = path.extension().and_then(|s| s.to_str()) else { continue };
            if ext != "wal" {
                continue;
            }
            let Ok(first_log_id) = stem.parse::<LogId>() else { continue };
            let meta = entry.metadata()?;
            out.push(WalFileInfo {
                fullname: path,
                first_log_id,
                last_log_id: first_log_id.saturating_sub(1),
                mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                size: meta.len(),
            });
        }
        Ok(out)
    }

    /// Backward-scan a file's trailing length footers to find the real end
    /// if an append was interrupted, returning the valid byte length and
    /// the decoded entries up to that point.
    fn recover_tail(path: &Path) -> Result<(u64, Vec<LogEntry>)> {
        let mut f = File::open(path)?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;

        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset < buf.len() {
            match LogEntry::decode(&buf[offset..]) {
                Ok((entry, len)) => {
                    entries.push(entry);
                    offset += len;
                }
                Err(_) => break,
            }
        }
        Ok((offset as u64, entries))
    }

    pub fn files(&self) -> &[WalFileInfo] {
        &self.files
    }

    pub fn last_log_term(&self) -> TermId {
        self.last_log_term
    }

    pub fn first_log_id(&self) -> LogId {
        self.files.first().map(|f| f.first_log_id).unwrap_or(0)
    }

    pub fn last_log_id(&self) -> LogId {
        self.files.last().map(|f| f.last_log_id).unwrap_or(0)
    }

    /// Start a brand-new active file named after `first_log_id`, closing
    /// whatever was open (used for both the very first append and rotation).
    pub fn open_new_file(&mut self, first_log_id: LogId) -> Result<()> {
        if let Some(mut w) = self.current.take() {
            w.flush()?;
        }
        let path = self.dir.join(file_name_for(first_log_id));
        let f = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
        self.current = Some(BufWriter::new(f));
        self.files.push(WalFileInfo {
            fullname: path,
            first_log_id,
            last_log_id: first_log_id.saturating_sub(1),
            mtime: SystemTime::now(),
            size: 0,
        });
        Ok(())
    }

    /// Write already-encoded records to the active file.
    pub fn write_encoded(&mut self, chunks: &[Vec<u8>], last_log_id: LogId, last_log_term: TermId) -> Result<()> {
        let w = self.current.as_mut().ok_or_else(|| {
            RaftError::WalCorruption("no active WAL file to append to".to_string())
        })?;
        let slices: Vec<IoSlice> = chunks.iter().map(|c| IoSlice::new(c)).collect();
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        let mut written = 0usize;
        let mut remaining = &slices[..];
        while written < total && !remaining.is_empty() {
            let n = w.write_vectored(remaining)?;
            if n == 0 {
                return Err(RaftError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "write_vectored wrote 0 bytes",
                )));
            }
            written += n;
            remaining = Self::advance_slices(remaining, n);
        }
        w.flush()?;
        if let Some(info) = self.files.last_mut() {
            info.last_log_id = last_log_id;
            info.size += total as u64;
            info.mtime = SystemTime::now();
        }
        self.last_log_term = last_log_term;
        Ok(())
    }

    fn advance_slices<'a>(slices: &'a [IoSlice<'a>], mut n: usize) -> &'a [IoSlice<'a>] {
        let mut i = 0;
        while i < slices.len() && n >= slices[i].len() {
            n -= slices[i].len();
            i += 1;
        }
        &slices[i..]
    }

    /// `fdatasync` the active file, called by the Flusher after a write.
    pub fn sync(&self) -> Result<()> {
        if let Some(w) = &self.current {
            w.get_ref().sync_data()?;
        }
        Ok(())
    }

    pub fn active_size(&self) -> u64 {
        self.files.last().map(|f| f.size).unwrap_or(0)
    }

    /// Truncate the file containing `k+1` to the start of that record and
    /// discard subsequent files, per `rollbackToLog`.
    pub fn rollback_to(&mut self, k: LogId) -> Result<()> {
        let idx = self.files.iter().position(|f| k + 1 >= f.first_log_id && k + 1 <= f.last_log_id.max(f.first_log_id));
        let Some(idx) = idx.or_else(|| self.files.iter().position(|f| f.first_log_id > k)) else {
            return Ok(());
        };

        for removed in self.files.drain(idx + 1..).collect::<Vec<_>>() {
            fs::remove_file(&removed.fullname)?;
        }

        let target = &mut self.files[idx];
        if let Some(mut w) = self.current.take() {
            w.flush().ok();
        }
        let mut f = File::open(&target.fullname)?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        let mut offset = 0usize;
        let mut last_id = target.first_log_id - 1;
        let mut last_term = self.last_log_term;
        while offset < buf.len() {
            match LogEntry::decode(&buf[offset..]) {
                Ok((entry, len)) => {
                    if entry.log_id > k {
                        break;
                    }
                    last_id = entry.log_id;
                    last_term = entry.term;
                    offset += len;
                }
                Err(_) => break,
            }
        }
        let truncated = OpenOptions::new().write(true).open(&target.fullname)?;
        truncated.set_len(offset as u64)?;
        target.size = offset as u64;
        target.last_log_id = last_id;
        self.last_log_term = last_term;
        self.current = Some(BufWriter::new(
            OpenOptions::new().append(true).open(&target.fullname)?,
        ));
        Ok(())
    }

    /// Truncate everything; next append uses id 1.
    pub fn reset(&mut self) -> Result<()> {
        if let Some(mut w) = self.current.take() {
            w.flush().ok();
        }
        for f in self.files.drain(..) {
            fs::remove_file(&f.fullname)?;
        }
        self.last_log_term = 0;
        Ok(())
    }

    /// Hard-link the current WAL directory's files into `dest_dir` for
    /// external snapshot/backup. The implementation must not truncate
    /// hard-linked files afterward — rotate instead. Rollback after linking
    /// is undefined: callers must rotate before rolling back a directory
    /// with live links.
    pub fn link_current_wal(&self, dest_dir: &Path) -> Result<()> {
        fs::create_dir_all(dest_dir)?;
        for f in &self.files {
            let dest = dest_dir.join(f.fullname.file_name().unwrap());
            if dest.exists() {
                continue;
            }
            fs::hard_link(&f.fullname, dest)?;
        }
        Ok(())
    }

    /// Advisory retention: delete files entirely below `below_log_id` whose
    /// `mtime` is also older than `ttl`.
    pub fn clean_wal(&mut self, below_log_id: LogId, ttl: std::time::Duration) -> Result<()> {
        let now = SystemTime::now();
        let mut keep = Vec::new();
        for f in self.files.drain(..) {
            let stale = now.duration_since(f.mtime).unwrap_or_default() > ttl;
            if f.last_log_id < below_log_id && stale {
                fs::remove_file(&f.fullname)?;
            } else {
                keep.push(f);
            }
        }
        self.files = keep;
        Ok(())
    }

    /// Read every on-disk entry in `[from, to]` by locating the covering
    /// files (binary search over the file index) and linear-scanning
    /// forward within each.
    pub fn read_range(&self, from: LogId, to: LogId) -> Result<Vec<LogEntry>> {
        let mut out = Vec::new();
        for info in self.files.iter() {
            if info.last_log_id < from {
                continue;
            }
            if info.first_log_id > to {
                break;
            }
            let mut f = File::open(&info.fullname)?;
            let mut buf = Vec::new();
            f.read_to_end(&mut buf)?;
            let mut offset = 0usize;
            while offset < buf.len() {
                match LogEntry::decode(&buf[offset..]) {
                    Ok((entry, len)) => {
                        if entry.log_id > to {
                            break;
                        }
                        if entry.log_id >= from {
                            out.push(entry);
                        }
                        offset += len;
                    }
                    Err(_) => break,
                }
            }
        }
        Ok(out)
    }

    pub fn seek_len(&mut self) -> Result<u64> {
        if let Some(w) = self.current.as_mut() {
            Ok(w.get_mut().seek(SeekFrom::End(0))?)
        } else {
            Ok(0)
        }
    }
}
