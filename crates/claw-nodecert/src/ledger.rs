//! CA issuance ledger and serial counter.
//!
//! Each CA level keeps two files next to its key: `serial` (the next serial
//! number, hex) and `index.txt` (one tab-separated line per issued
//! certificate). Every issuance holds an advisory lock on `.lock` so the
//! read-increment-write of the counter never interleaves across threads
//! or processes. The kernel drops the lock with its holder, so a crashed
//! run leaves nothing to clean up.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, Utc};
use rustix::fs::{flock, FlockOperation};
use rustix::io::Errno;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::fsutil;

/// Serial counter file name.
pub const SERIAL_FILE: &str = "serial";

/// Issuance ledger file name.
pub const INDEX_FILE: &str = "index.txt";

/// Lock file name. The file persists; only the advisory lock on it matters.
pub const LOCK_FILE: &str = ".lock";

/// First serial handed out by a fresh ledger.
pub const FIRST_SERIAL: u64 = 1;

/// Default time to wait for the lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const LOCK_POLL: Duration = Duration::from_millis(20);
const INDEX_TIME_FORMAT: &str = "%y%m%d%H%M%SZ";

/// One issued certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Serial assigned by the counter.
    pub serial: u64,
    /// End of the certificate's validity window.
    pub not_after: DateTime<Utc>,
    /// SHA-256 of the DER request that was signed.
    pub request_fingerprint: String,
    /// Subject of the issued certificate.
    pub subject: String,
}

impl LedgerEntry {
    fn to_line(&self) -> String {
        format!(
            "V\t{}\t\t{:02X}\t{}\t{}\n",
            self.not_after.format(INDEX_TIME_FORMAT),
            self.serial,
            self.request_fingerprint,
            self.subject.replace(['\t', '\n'], " ")
        )
    }

    fn from_line(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split('\t').collect();
        let [status, not_after, _revoked, serial, fingerprint, subject] = fields.as_slice() else {
            return Err(Error::Ledger(format!("malformed index line: {line:?}")));
        };
        if *status != "V" {
            return Err(Error::Ledger(format!("unsupported index status '{status}'")));
        }
        let not_after = NaiveDateTime::parse_from_str(not_after, INDEX_TIME_FORMAT)
            .map_err(|e| Error::Ledger(format!("bad expiry '{not_after}': {e}")))?
            .and_utc();
        let serial = u64::from_str_radix(serial, 16)
            .map_err(|e| Error::Ledger(format!("bad serial '{serial}': {e}")))?;
        Ok(Self {
            serial,
            not_after,
            request_fingerprint: (*fingerprint).to_string(),
            subject: (*subject).to_string(),
        })
    }
}

/// Transactional serial counter plus append-only issuance record.
pub trait IssuanceLedger {
    /// Reserves the next serial, runs `issue` with it, then records the
    /// entry `issue` returns.
    ///
    /// The counter is advanced and persisted before `issue` runs, so a
    /// failure or crash afterwards burns the serial instead of reusing it.
    ///
    /// # Errors
    ///
    /// Returns the error from `issue`, or a ledger/lock error.
    fn issue<T>(&self, issue: impl FnOnce(u64) -> Result<(T, LedgerEntry)>) -> Result<T>;

    /// Next serial that would be assigned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Ledger`] if the counter is unreadable.
    fn next_serial(&self) -> Result<u64>;

    /// Every recorded entry, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Ledger`] if the record is corrupt.
    fn entries(&self) -> Result<Vec<LedgerEntry>>;

    /// Returns true if a request with this fingerprint was already signed.
    ///
    /// # Errors
    ///
    /// As [`Self::entries`].
    fn has_signed(&self, request_fingerprint: &str) -> Result<bool> {
        Ok(self
            .entries()?
            .iter()
            .any(|e| e.request_fingerprint == request_fingerprint))
    }
}

/// File-backed ledger guarded by an advisory file lock.
#[derive(Debug, Clone)]
pub struct FileLedger {
    dir: PathBuf,
    lock_timeout: Duration,
}

impl FileLedger {
    /// Opens (and on first use initializes) the ledger in `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Ledger`] if the record exists but the counter does
    /// not; the counter is never reconstructed from the record.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(Error::io(dir))?;
        let ledger = Self {
            dir: dir.to_path_buf(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        };

        let serial = ledger.serial_path();
        let index = ledger.index_path();
        if !serial.exists() {
            if index.exists() && fs::metadata(&index).map_err(Error::io(&index))?.len() > 0 {
                return Err(Error::Ledger(format!(
                    "{} is missing but {} has entries; refusing to reconstruct the counter",
                    serial.display(),
                    index.display()
                )));
            }
            fsutil::write_if_absent(&serial, format_serial(FIRST_SERIAL).as_bytes(), fsutil::PUBLIC_MODE)?;
            fsutil::write_if_absent(&index, b"", fsutil::PUBLIC_MODE)?;
            info!(dir = %dir.display(), "initialized issuance ledger");
        }
        Ok(ledger)
    }

    /// Overrides how long [`IssuanceLedger::issue`] waits for the lock.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Directory holding the ledger files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn serial_path(&self) -> PathBuf {
        self.dir.join(SERIAL_FILE)
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    fn read_serial(&self) -> Result<u64> {
        let path = self.serial_path();
        let text = fsutil::read_required_text(&path)?;
        u64::from_str_radix(text.trim(), 16)
            .map_err(|e| Error::Ledger(format!("corrupt serial counter {}: {e}", path.display())))
    }

    fn append(&self, entry: &LedgerEntry) -> Result<()> {
        let path = self.index_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(Error::io(&path))?;
        file.write_all(entry.to_line().as_bytes()).map_err(Error::io(&path))?;
        file.sync_all().map_err(Error::io(&path))
    }
}

impl IssuanceLedger for FileLedger {
    fn issue<T>(&self, issue: impl FnOnce(u64) -> Result<(T, LedgerEntry)>) -> Result<T> {
        let _lock = LockGuard::acquire(&self.dir.join(LOCK_FILE), self.lock_timeout)?;

        let serial = self.read_serial()?;
        let next = serial
            .checked_add(1)
            .ok_or_else(|| Error::Ledger("serial counter exhausted".into()))?;
        fsutil::atomic_write(&self.serial_path(), format_serial(next).as_bytes(), fsutil::PUBLIC_MODE)?;

        let (value, entry) = issue(serial)?;
        if entry.serial != serial {
            return Err(Error::Ledger(format!(
                "issued entry carries serial {:02X}, expected {serial:02X}",
                entry.serial
            )));
        }
        self.append(&entry)?;
        debug!(serial, subject = %entry.subject, "recorded issuance");
        Ok(value)
    }

    fn next_serial(&self) -> Result<u64> {
        self.read_serial()
    }

    fn entries(&self) -> Result<Vec<LedgerEntry>> {
        let path = self.index_path();
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(&path)(e)),
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(LedgerEntry::from_line)
            .collect()
    }
}

fn format_serial(serial: u64) -> String {
    format!("{serial:02X}\n")
}

/// Exclusive `flock` held for as long as the guard (and its descriptor)
/// lives.
struct LockGuard {
    _file: File,
}

impl LockGuard {
    fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(Error::io(path))?;
        let deadline = Instant::now() + timeout;
        loop {
            match flock(&file, FlockOperation::NonBlockingLockExclusive) {
                Ok(()) => {
                    debug!(path = %path.display(), "acquired ledger lock");
                    return Ok(Self { _file: file });
                }
                Err(Errno::WOULDBLOCK) => {
                    if Instant::now() >= deadline {
                        return Err(Error::LockTimeout(path.to_path_buf()));
                    }
                    thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(Error::io(path)(e.into())),
            }
        }
    }
}
