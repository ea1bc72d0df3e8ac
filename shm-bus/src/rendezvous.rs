use std::ffi::CString;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::mqueue::{mq_close, mq_open, mq_receive, mq_send, mq_unlink, MQ_OFlag, MqAttr, MqdT};
use nix::sys::stat::Mode;

use crate::error::{BusError, Result};
use crate::names::Namespace;

/// Depth used for the detector-to-renderer ordering signal.
pub const SYNC_DEPTH: i64 = 512;
/// Depth used for the startup readiness handshake. Two workers signal
/// once each; the headroom is for reuse across a restarted launch.
pub const READY_DEPTH: i64 = 4;

const TOKEN: [u8; 1] = [0];

/// One-directional FIFO of 1-byte tokens. One token per producer
/// event; a consumer blocks until the event has happened. Used for the
/// "new detection result published" signal and for the startup
/// readiness handshake that replaces any fixed spawn delay.
pub struct Rendezvous {
    name: String,
    mq: Option<MqdT>,
}

impl Rendezvous {
    /// Creator side. The descriptor is non-blocking: a producer whose
    /// consumer has fallen `depth` tokens behind drops the token rather
    /// than stalling the data plane, and a creating consumer polls via
    /// [`wait_timeout`](Rendezvous::wait_timeout).
    pub fn create(ns: &Namespace, endpoint: &str, depth: i64) -> Result<Self> {
        let name = ns.object(endpoint);
        let cname = cstring(&name)?;
        let attr = MqAttr::new(0, depth, TOKEN.len() as i64, 0);
        let mq = mq_open(
            cname.as_c_str(),
            MQ_OFlag::O_CREAT | MQ_OFlag::O_EXCL | MQ_OFlag::O_RDWR | MQ_OFlag::O_NONBLOCK,
            Mode::S_IRUSR | Mode::S_IWUSR,
            Some(&attr),
        )
        .map_err(|e| match e {
            Errno::EEXIST => BusError::AlreadyExists { name: name.clone() },
            e => BusError::Os(e),
        })?;
        Ok(Self {
            name,
            mq: Some(mq),
        })
    }

    /// Opener side; [`wait`](Rendezvous::wait) blocks.
    pub fn open(ns: &Namespace, endpoint: &str) -> Result<Self> {
        let name = ns.object(endpoint);
        let cname = cstring(&name)?;
        let mq = mq_open(cname.as_c_str(), MQ_OFlag::O_RDWR, Mode::empty(), None).map_err(|e| match e {
            Errno::ENOENT => BusError::NotFound { name: name.clone() },
            e => BusError::Os(e),
        })?;
        Ok(Self {
            name,
            mq: Some(mq),
        })
    }

    pub fn force_remove(ns: &Namespace, endpoint: &str) {
        let name = ns.object(endpoint);
        if let Ok(cname) = cstring(&name) {
            match mq_unlink(cname.as_c_str()) {
                Ok(()) | Err(Errno::ENOENT) => {}
                Err(e) => log::warn!("could not remove rendezvous {}: {}", name, e),
            }
        }
    }

    /// Enqueue one token. On a non-blocking descriptor a full queue
    /// drops the token; the consumer is already that far behind.
    pub fn signal(&self) -> Result<()> {
        match mq_send(self.mqd(), &TOKEN, 0) {
            Ok(()) => Ok(()),
            Err(Errno::EAGAIN) => {
                log::debug!("rendezvous {} full, token dropped", self.name);
                Ok(())
            }
            Err(e) => Err(BusError::Os(e)),
        }
    }

    /// Block until a token arrives. Only meaningful on a descriptor
    /// from [`open`](Rendezvous::open).
    pub fn wait(&self) -> Result<()> {
        let mut buf = [0u8; 8];
        let mut prio = 0u32;
        loop {
            match mq_receive(self.mqd(), &mut buf, &mut prio) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(BusError::Os(e)),
            }
        }
    }

    /// Consume a token if one is queued. `Ok(false)` when empty.
    /// Only meaningful on a non-blocking (creator) descriptor.
    pub fn try_wait(&self) -> Result<bool> {
        let mut buf = [0u8; 8];
        let mut prio = 0u32;
        loop {
            match mq_receive(self.mqd(), &mut buf, &mut prio) {
                Ok(_) => return Ok(true),
                Err(Errno::EAGAIN) => return Ok(false),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(BusError::Os(e)),
            }
        }
    }

    /// Poll for a token until `timeout` elapses. `Err(ETIMEDOUT)` when
    /// none arrives in time. Only meaningful on a creator descriptor.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_wait()? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BusError::Os(Errno::ETIMEDOUT));
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn mqd(&self) -> &MqdT {
        // set in both constructors, taken only in drop
        self.mq.as_ref().expect("queue descriptor closed")
    }
}

impl Drop for Rendezvous {
    fn drop(&mut self) {
        if let Some(mq) = self.mq.take() {
            let _ = mq_close(mq);
        }
    }
}

fn cstring(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| BusError::Malformed("ipc name contains a nul byte"))
}
