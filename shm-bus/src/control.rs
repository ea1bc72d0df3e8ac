use std::ffi::CString;
use std::fmt::{Display, Formatter};

use nix::errno::Errno;
use nix::mqueue::{mq_close, mq_open, mq_receive, mq_send, mq_unlink, MQ_OFlag, MqAttr, MqdT};
use nix::sys::stat::Mode;

use crate::error::{BusError, Result};
use crate::names::{self, Namespace};

/// Commands a control queue can hold at once before senders see
/// [`BusError::QueueFull`].
pub const CONTROL_QUEUE_DEPTH: i64 = 10;

/// Wire layout per queue: a single little-endian i32 (the fps on the
/// frame-rate queue, the mode code on the mode queue).
const MESSAGE_WIRE_LEN: usize = std::mem::size_of::<i32>();

/// Visual treatment applied to a detected region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedactionMode {
    Fill,
    Blur,
}

impl RedactionMode {
    pub fn code(self) -> i32 {
        match self {
            RedactionMode::Fill => 0,
            RedactionMode::Blur => 1,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(RedactionMode::Fill),
            1 => Some(RedactionMode::Blur),
            _ => None,
        }
    }
}

impl Display for RedactionMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RedactionMode::Fill => write!(f, "fill"),
            RedactionMode::Blur => write!(f, "blur"),
        }
    }
}

/// A tuning command. Transient; consumed at most once by the listener
/// of the destination process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    SetFrameRateLimit(u32),
    SetRedactionMode(RedactionMode),
}

/// Which control endpoint a queue instance serves. Decides both the
/// queue name and how its single-integer payload decodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlKind {
    FrameRateLimit,
    RedactionMode,
}

impl ControlKind {
    fn endpoint(self) -> &'static str {
        match self {
            ControlKind::FrameRateLimit => names::FPS_COMMANDS,
            ControlKind::RedactionMode => names::MODE_COMMANDS,
        }
    }
}

/// Ordered FIFO of [`Command`]s over a POSIX message queue. The
/// supervisor creates and sends (non-blocking); the destination
/// process opens and blocks on [`recv`](ControlQueue::recv) in a
/// dedicated listener.
pub struct ControlQueue {
    kind: ControlKind,
    name: String,
    mq: Option<MqdT>,
}

impl ControlQueue {
    /// Creator (sender) side. The descriptor is non-blocking so a full
    /// queue surfaces as [`BusError::QueueFull`] instead of a hang.
    pub fn create(ns: &Namespace, kind: ControlKind) -> Result<Self> {
        let name = ns.object(kind.endpoint());
        let cname = cstring(&name)?;
        let attr = MqAttr::new(0, CONTROL_QUEUE_DEPTH, MESSAGE_WIRE_LEN as i64, 0);
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
            kind,
            name,
            mq: Some(mq),
        })
    }

    /// Listener (receiver) side; [`recv`](ControlQueue::recv) blocks.
    pub fn open(ns: &Namespace, kind: ControlKind) -> Result<Self> {
        let name = ns.object(kind.endpoint());
        let cname = cstring(&name)?;
        let mq = mq_open(cname.as_c_str(), MQ_OFlag::O_RDWR, Mode::empty(), None).map_err(|e| match e {
            Errno::ENOENT => BusError::NotFound { name: name.clone() },
            e => BusError::Os(e),
        })?;
        Ok(Self {
            kind,
            name,
            mq: Some(mq),
        })
    }

    pub fn force_remove(ns: &Namespace, kind: ControlKind) {
        let name = ns.object(kind.endpoint());
        if let Ok(cname) = cstring(&name) {
            match mq_unlink(cname.as_c_str()) {
                Ok(()) | Err(Errno::ENOENT) => {}
                Err(e) => log::warn!("could not remove control queue {}: {}", name, e),
            }
        }
    }

    pub fn kind(&self) -> ControlKind {
        self.kind
    }

    pub fn send(&self, cmd: Command) -> Result<()> {
        let code = match (self.kind, cmd) {
            (ControlKind::FrameRateLimit, Command::SetFrameRateLimit(fps)) => fps as i32,
            (ControlKind::RedactionMode, Command::SetRedactionMode(mode)) => mode.code(),
            _ => return Err(BusError::Malformed("command does not belong to this queue")),
        };
        let mqd = self.mqd();
        match mq_send(mqd, &code.to_le_bytes(), 0) {
            Ok(()) => Ok(()),
            Err(Errno::EAGAIN) => Err(BusError::QueueFull),
            Err(e) => Err(BusError::Os(e)),
        }
    }

    /// Blocking receive of the next command in send order. Undecodable
    /// payloads come back as [`BusError::Malformed`]; the listener logs
    /// and keeps going.
    pub fn recv(&self) -> Result<Command> {
        let mqd = self.mqd();
        let mut buf = [0u8; 16];
        let mut prio = 0u32;
        let received = loop {
            match mq_receive(mqd, &mut buf, &mut prio) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(BusError::Os(e)),
            }
        };
        if received != MESSAGE_WIRE_LEN {
            return Err(BusError::Malformed("control message has wrong size"));
        }
        let code = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        match self.kind {
            ControlKind::FrameRateLimit => {
                if code <= 0 {
                    return Err(BusError::Malformed("frame rate limit must be positive"));
                }
                Ok(Command::SetFrameRateLimit(code as u32))
            }
            ControlKind::RedactionMode => RedactionMode::from_code(code)
                .map(Command::SetRedactionMode)
                .ok_or(BusError::Malformed("unknown redaction mode code")),
        }
    }

    fn mqd(&self) -> &MqdT {
        // set in both constructors, taken only in drop
        self.mq.as_ref().expect("queue descriptor closed")
    }
}

impl Drop for ControlQueue {
    fn drop(&mut self) {
        if let Some(mq) = self.mq.take() {
            let _ = mq_close(mq);
        }
    }
}

fn cstring(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| BusError::Malformed("ipc name contains a nul byte"))
}
