use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Resume hook run when a queued requester is granted a slot
pub type AdmitCallback = Box<dyn FnOnce()>;

/// Identity under which a caller waits for, holds and returns a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequesterId(Uuid);

impl RequesterId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequesterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of [`AdmissionQueue::request_slot`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The callback already ran
    Admitted,
    /// Waiting; `position` is zero-based from the head of the queue
    Queued { position: usize },
}

/// Outcome of [`AdmissionQueue::release_slot`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The requester was still waiting and has been dropped from the queue
    Withdrawn,
    /// The slot went straight to the oldest waiter
    Transferred(RequesterId),
    /// The slot went back to the pool
    Freed,
}

/// Bounds the number of concurrently open connections.
///
/// Requesters that arrive while every slot is taken wait in FIFO order;
/// their callbacks run synchronously, from inside `release_slot` or `resize`,
/// at the moment a slot becomes theirs. Callbacks run after the queue's own
/// bookkeeping is done, but they must not call back into the queue.
///
/// Lowering the limit never closes anything. While more slots are open than
/// the new limit allows, returned slots are freed rather than handed to
/// waiters, so the pool drains down to the new bound.
pub struct AdmissionQueue {
    max: usize,
    open: usize,
    blocked: VecDeque<(RequesterId, AdmitCallback)>,
}

impl AdmissionQueue {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            open: 0,
            blocked: VecDeque::new(),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn open_count(&self) -> usize {
        self.open
    }

    pub fn queued_len(&self) -> usize {
        self.blocked.len()
    }

    pub fn is_queued(&self, requester: RequesterId) -> bool {
        self.blocked.iter().any(|(id, _)| *id == requester)
    }

    /// Ask for a slot; `on_admitted` runs now or when the slot frees up.
    pub fn request_slot(
        &mut self,
        requester: RequesterId,
        on_admitted: AdmitCallback,
    ) -> Admission {
        if self.open >= self.max {
            self.blocked.push_back((requester, on_admitted));
            let position = self.blocked.len() - 1;
            debug!(%requester, position, open = self.open, max = self.max, "Socket request queued");
            return Admission::Queued { position };
        }

        self.open += 1;
        debug!(%requester, open = self.open, max = self.max, "Socket admitted");
        on_admitted();
        Admission::Admitted
    }

    /// Give a slot back, or withdraw a requester that is still waiting.
    ///
    /// A returned slot goes to the oldest waiter, except while more slots are
    /// open than the current limit: then it is freed and the waiters stay
    /// queued.
    pub fn release_slot(&mut self, requester: RequesterId) -> Release {
        if let Some(index) = self.blocked.iter().position(|(id, _)| *id == requester) {
            // Abandoned before it was ever admitted
            self.blocked.remove(index);
            debug!(%requester, "Queued socket request withdrawn");
            return Release::Withdrawn;
        }

        if self.open <= self.max {
            if let Some((next, callback)) = self.blocked.pop_front() {
                debug!(%requester, %next, "Socket handed to next waiter");
                callback();
                return Release::Transferred(next);
            }
        }

        if self.open == 0 {
            warn!(%requester, "Socket released with no open sockets");
        } else {
            self.open -= 1;
        }
        debug!(%requester, open = self.open, max = self.max, "Socket freed");
        Release::Freed
    }

    /// Change the limit; growth admits waiters immediately.
    ///
    /// Returns the number of requesters admitted by this call.
    pub fn resize(&mut self, new_max: usize) -> usize {
        let old_max = self.max;
        self.max = new_max;

        if new_max <= old_max {
            if self.open > new_max {
                debug!(open = self.open, new_max, "Socket limit lowered below open count");
            }
            return 0;
        }

        let count = (new_max - old_max).min(self.blocked.len());
        let admitted: Vec<(RequesterId, AdmitCallback)> = self.blocked.drain(..count).collect();
        self.open += admitted.len();
        debug!(
            old_max,
            new_max,
            admitted = admitted.len(),
            open = self.open,
            "Socket limit raised"
        );

        for (_, callback) in admitted {
            callback();
        }
        count
    }
}

impl fmt::Debug for AdmissionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionQueue")
            .field("max", &self.max)
            .field("open", &self.open)
            .field("queued", &self.blocked.len())
            .finish()
    }
}
