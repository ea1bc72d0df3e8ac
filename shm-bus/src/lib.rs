#![allow(dead_code)]

//! Shared-memory data plane and message-queue control plane for the
//! redaction pipeline. Every type in here is safe to use from several
//! processes at once: the value channels serialize access with a lock
//! on the backing object, the queues are kernel FIFOs.

pub mod control;
pub mod detection;
pub mod error;
pub mod format;
pub mod frame;
pub mod names;
pub mod rendezvous;
pub mod shmem;

pub use error::{BusError, Result};

#[cfg(test)]
#[path = "channel_test.rs"]
mod channel_test;
