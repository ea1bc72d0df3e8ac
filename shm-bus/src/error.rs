use nix::errno::Errno;

pub type Result<T> = std::result::Result<T, BusError>;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Creating an object whose name is already taken, usually a stale
    /// remnant of a crashed run. Creators force-remove before create.
    #[error("ipc object already exists: {name}")]
    AlreadyExists { name: String },

    /// Opening an object its creator has not created yet.
    #[error("ipc object not found: {name}")]
    NotFound { name: String },

    /// A write larger than the channel's fixed capacity. Never
    /// truncated, never overflowed.
    #[error("payload of {len} bytes exceeds channel capacity of {capacity}")]
    CapacityExceeded { len: usize, capacity: usize },

    /// A frame whose byte size disagrees with the published format.
    /// This is a contract breach, not a tolerated resize.
    #[error("payload size mismatch: expected {expected} bytes, got {got}")]
    SizeMismatch { expected: usize, got: usize },

    /// Undecodable or out-of-model wire content.
    #[error("malformed payload: {0}")]
    Malformed(&'static str),

    /// A control queue at its depth limit; the command was not sent.
    #[error("control queue full, command dropped")]
    QueueFull,

    #[error("os error: {0}")]
    Os(#[from] Errno),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
