//! BO-backed synchronization objects.
//!
//! A [`SyncObject`] is a binary fence implemented as a small backing
//! allocation: including it in a submission's residency set makes the kernel
//! track the submission's completion against the allocation, which the
//! driver can then poll. The state machine is `Reset` → `Submitted` (set by
//! the queue after a successful kernel hand-off) → `Signaled` (observed by
//! a wait).

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::bo::{Bo, BoFlags, DrmDevice};
use crate::error::DriverError;

const SYNC_BO_SIZE: u64 = 0x1000;

const WAIT_BACKOFF_MIN: Duration = Duration::from_micros(10);
const WAIT_BACKOFF_MAX: Duration = Duration::from_millis(1);

/// Lifecycle state of a sync object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Not part of any in-flight submission.
    Reset,
    /// Handed to the kernel; will signal when the submission completes.
    Submitted,
    /// The submission completed.
    Signaled,
}

/// A binary, BO-backed sync object.
pub struct SyncObject {
    bo: Arc<Bo>,
    state: Mutex<SyncState>,
}

impl SyncObject {
    /// Create a sync object, initially signaled or reset.
    pub fn new(dev: &Arc<dyn DrmDevice>, signaled: bool) -> Result<Self, DriverError> {
        let bo = dev.new_bo(SYNC_BO_SIZE, 0, BoFlags::GART)?;
        Ok(Self {
            bo,
            state: Mutex::new(if signaled {
                SyncState::Signaled
            } else {
                SyncState::Reset
            }),
        })
    }

    /// The allocation the kernel tracks completion against.
    pub fn bo(&self) -> &Arc<Bo> {
        &self.bo
    }

    /// Current state.
    pub fn state(&self) -> SyncState {
        *self.state.lock()
    }

    /// Return the object to the reset state.
    pub fn reset(&self) {
        *self.state.lock() = SyncState::Reset;
    }

    /// Transition reset → submitted. The queue calls this only after the
    /// kernel accepted the submission that will signal the object.
    pub(crate) fn mark_submitted(&self) {
        let mut state = self.state.lock();
        assert_eq!(*state, SyncState::Reset, "sync object signaled twice without a reset");
        *state = SyncState::Submitted;
    }

    /// Block until the object signals or `timeout` elapses.
    ///
    /// Polls the kernel completion flag with an exponential sleep backoff;
    /// never spins unbounded. An object still in the reset state is waited
    /// on too, in case another thread is about to submit it. On timeout the
    /// caller decides whether to retry or declare the device lost.
    pub fn wait(&self, dev: &dyn DrmDevice, timeout: Duration) -> Result<(), DriverError> {
        let deadline = Instant::now() + timeout;
        let mut backoff = WAIT_BACKOFF_MIN;

        loop {
            match self.state() {
                SyncState::Signaled => return Ok(()),
                SyncState::Reset => {
                    // Not submitted yet; keep polling until the deadline.
                }
                SyncState::Submitted => {
                    if dev.bo_idle(&self.bo)? {
                        *self.state.lock() = SyncState::Signaled;
                        return Ok(());
                    }
                }
            }

            if Instant::now() >= deadline {
                log::warn!("sync wait timed out after {timeout:?}");
                return Err(DriverError::Timeout);
            }

            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(WAIT_BACKOFF_MAX);
        }
    }
}

impl std::fmt::Debug for SyncObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncObject")
            .field("bo", &self.bo.handle())
            .field("state", &self.state())
            .finish()
    }
}

static_assertions::assert_impl_all!(SyncObject: Send, Sync);
