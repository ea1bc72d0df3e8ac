use std::fs::File;
use std::os::fd::AsRawFd;
use std::time::Duration;

use bytes::Bytes;
use memmap2::MmapMut;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;

use crate::error::{BusError, Result};

/// Leading u64 recording how many bytes the last write covered, so a
/// snapshot returns exactly what was written and not the whole window.
const LEN_HEADER: usize = std::mem::size_of::<u64>();

/// A named, fixed-capacity shared-memory slot with latest-wins
/// semantics: one value, overwritten wholesale on every write, no
/// queue, no back-pressure. A fast producer overwrites values a slow
/// consumer never sees; a slow producer makes consumers re-read the
/// same value.
///
/// Mutual exclusion is an exclusive `flock` on the shm object's fd.
/// The kernel drops the lock when its holder dies, so a crashed writer
/// cannot wedge the channel.
pub struct SharedValueChannel {
    name: String,
    capacity: usize,
    file: File,
    map: MmapMut,
}

impl SharedValueChannel {
    /// Create the backing object. Fails with [`BusError::AlreadyExists`]
    /// when a same-named object is present (typically a stale remnant of
    /// a crashed run); creators call [`force_remove`] first.
    ///
    /// [`force_remove`]: SharedValueChannel::force_remove
    pub fn create(name: &str, capacity: usize) -> Result<Self> {
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| match e {
            Errno::EEXIST => BusError::AlreadyExists {
                name: name.to_string(),
            },
            e => BusError::Os(e),
        })?;
        let file = File::from(fd);
        file.set_len((LEN_HEADER + capacity) as u64)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            name: name.to_string(),
            capacity,
            file,
            map,
        })
    }

    /// Open an existing object. Fails with [`BusError::NotFound`] until
    /// the creator has both created and sized it.
    pub fn open(name: &str) -> Result<Self> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(|e| match e {
            Errno::ENOENT => BusError::NotFound {
                name: name.to_string(),
            },
            e => BusError::Os(e),
        })?;
        let file = File::from(fd);
        let len = file.metadata()?.len() as usize;
        if len < LEN_HEADER {
            // Created but not yet truncated by its owner.
            return Err(BusError::NotFound {
                name: name.to_string(),
            });
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            name: name.to_string(),
            capacity: len - LEN_HEADER,
            file,
            map,
        })
    }

    /// [`open`](SharedValueChannel::open), retried with a fixed backoff
    /// while the object does not exist yet.
    pub fn open_with_retry(name: &str, attempts: u32, backoff: Duration) -> Result<Self> {
        let mut remaining = attempts;
        loop {
            match Self::open(name) {
                Err(BusError::NotFound { .. }) if remaining > 1 => {
                    remaining -= 1;
                    std::thread::sleep(backoff);
                }
                other => return other,
            }
        }
    }

    /// Remove a named object if present. Expected, not exceptional, on
    /// startup after a crashed prior run.
    pub fn force_remove(name: &str) {
        match shm_unlink(name) {
            Ok(()) | Err(Errno::ENOENT) => {}
            Err(e) => log::warn!("could not remove shm object {}: {}", name, e),
        }
    }

    /// Overwrite the slot. Fails with [`BusError::CapacityExceeded`] if
    /// the payload does not fit; nothing is written in that case.
    pub fn write(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.capacity {
            return Err(BusError::CapacityExceeded {
                len: payload.len(),
                capacity: self.capacity,
            });
        }
        let _lock = ExclusiveLock::acquire(&self.file)?;
        self.map[..LEN_HEADER].copy_from_slice(&(payload.len() as u64).to_le_bytes());
        self.map[LEN_HEADER..LEN_HEADER + payload.len()].copy_from_slice(payload);
        Ok(())
    }

    /// Copy out the most recently completed write. Never a partial one:
    /// the lock serializes this against writers. An empty result means
    /// nothing has been written yet.
    pub fn read_snapshot(&self) -> Result<Bytes> {
        let _lock = ExclusiveLock::acquire(&self.file)?;
        let mut len_buf = [0u8; LEN_HEADER];
        len_buf.copy_from_slice(&self.map[..LEN_HEADER]);
        let len = u64::from_le_bytes(len_buf) as usize;
        if len > self.capacity {
            return Err(BusError::Malformed("stored length exceeds capacity"));
        }
        Ok(Bytes::copy_from_slice(
            &self.map[LEN_HEADER..LEN_HEADER + len],
        ))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Best-effort removal of the backing object at teardown. Existing
    /// mappings stay valid until every process unmaps.
    pub fn unlink(&self) {
        Self::force_remove(&self.name);
    }
}

/// RAII flock guard. Held only for the duration of a memory copy.
struct ExclusiveLock<'a> {
    file: &'a File,
}

impl<'a> ExclusiveLock<'a> {
    fn acquire(file: &'a File) -> Result<Self> {
        loop {
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                return Ok(Self { file });
            }
            let errno = Errno::last();
            if errno != Errno::EINTR {
                return Err(BusError::Os(errno));
            }
        }
    }
}

impl Drop for ExclusiveLock<'_> {
    fn drop(&mut self) {
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_test::unique_name;

    #[test]
    fn write_then_snapshot_round_trips() {
        let name = unique_name("slot");
        SharedValueChannel::force_remove(&name);
        let mut ch = SharedValueChannel::create(&name, 64).unwrap();

        ch.write(b"hello").unwrap();
        assert_eq!(ch.read_snapshot().unwrap().as_ref(), b"hello");

        // latest write wins, including shorter ones
        ch.write(b"hi").unwrap();
        assert_eq!(ch.read_snapshot().unwrap().as_ref(), b"hi");

        ch.unlink();
    }

    #[test]
    fn create_twice_is_already_exists() {
        let name = unique_name("dup");
        SharedValueChannel::force_remove(&name);
        let _ch = SharedValueChannel::create(&name, 16).unwrap();
        match SharedValueChannel::create(&name, 16) {
            Err(BusError::AlreadyExists { .. }) => {}
            other => panic!("expected AlreadyExists, got {:?}", other.map(|_| ())),
        }
        SharedValueChannel::force_remove(&name);
    }

    #[test]
    fn open_before_create_is_not_found() {
        let name = unique_name("missing");
        SharedValueChannel::force_remove(&name);
        match SharedValueChannel::open(&name) {
            Err(BusError::NotFound { .. }) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn oversized_write_is_rejected_untouched() {
        let name = unique_name("cap");
        SharedValueChannel::force_remove(&name);
        let mut ch = SharedValueChannel::create(&name, 4).unwrap();
        ch.write(b"ok").unwrap();
        match ch.write(b"too long for four bytes") {
            Err(BusError::CapacityExceeded { len, capacity }) => {
                assert_eq!(capacity, 4);
                assert!(len > 4);
            }
            other => panic!("expected CapacityExceeded, got {:?}", other),
        }
        // prior value intact
        assert_eq!(ch.read_snapshot().unwrap().as_ref(), b"ok");
        ch.unlink();
    }

    #[test]
    fn reader_sees_writes_from_a_second_handle() {
        let name = unique_name("xproc");
        SharedValueChannel::force_remove(&name);
        let mut writer = SharedValueChannel::create(&name, 32).unwrap();
        let reader = SharedValueChannel::open(&name).unwrap();
        assert_eq!(reader.capacity(), 32);

        assert!(reader.read_snapshot().unwrap().is_empty());
        writer.write(b"published").unwrap();
        assert_eq!(reader.read_snapshot().unwrap().as_ref(), b"published");
        writer.unlink();
    }
}
