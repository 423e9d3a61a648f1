//! Readiness-driven dispatch
//!
//! One [`Reactor`] multiplexes every registered handle on a single thread.
//! Each [`react`](Reactor::react) tick arms the registry with the
//! [`polling`] crate's `Poller`, waits for readability, snapshots the
//! ready set, then dispatches callbacks one handle at a time: urgent data
//! (channel 2) is probed first, then the readable callback (channel 0).
//! Callbacks may add, remove, or close any handle, including themselves;
//! membership changes take effect without disturbing the tick in flight.
//!
//! Registrations are removed again at the end of every tick, so the
//! poller carries no state between ticks and a handle dropped by its
//! owner can never leave a stale entry behind.
//!
//! Ownership follows the owner/observer split: whoever created a handle
//! owns it (`Rc`), the registry holds `Weak` references keyed by the raw
//! descriptor. Entries whose owner dropped them, and handles observed
//! closed, are pruned within the same tick.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::rc::{Rc, Weak};
use std::time::Duration;

use polling::{Event as PollEvent, Poller};

use crate::error::{Error, Result};

/// Contract between the reactor and anything it dispatches to.
///
/// `on_out_of_band` and `on_readable` correspond to the urgent and
/// in-band channels of a ready descriptor. A callback error is caught by
/// the reactor, handed to [`on_error`](Self::on_error), and never
/// propagated to the caller of `react`.
pub trait Reactive {
    /// Stable identity, derived from the underlying descriptor
    fn id(&self) -> i32;

    /// False once the handle has released its descriptor; the reactor
    /// drops closed handles from the registry.
    fn is_open(&self) -> bool;

    /// The descriptor is readable (or at EOF)
    fn on_readable(&mut self) -> Result<()>;

    /// True when urgent data is pending on the descriptor. Checked for
    /// each ready handle before the readable dispatch; handles without an
    /// urgent channel keep the default.
    fn out_of_band_pending(&mut self) -> bool {
        false
    }

    /// Urgent data is pending
    fn on_out_of_band(&mut self) -> Result<()> {
        Ok(())
    }

    /// A callback returned an error the reactor swallowed. Implementations
    /// that did not already tear themselves down should do so here.
    fn on_error(&mut self, _err: &Error) {}
}

/// Shared handle as stored by owners and passed to [`Reactor::add`]
pub type Handle = Rc<RefCell<dyn Reactive>>;

/// Readiness dispatcher over a set of registered handles
pub struct Reactor {
    poller: Poller,
    handles: RefCell<BTreeMap<i32, Weak<RefCell<dyn Reactive>>>>,
}

impl Reactor {
    /// Create an empty reactor
    pub fn new() -> Result<Self> {
        Ok(Self {
            poller: Poller::new().map_err(Error::Io)?,
            handles: RefCell::new(BTreeMap::new()),
        })
    }

    /// Register a handle. The reactor keeps only a weak reference; the
    /// caller remains the owner.
    pub fn add(&self, handle: Handle) {
        let id = handle.borrow().id();
        self.handles.borrow_mut().insert(id, Rc::downgrade(&handle));
    }

    /// Drop a handle from the registry by id. Missing ids are ignored.
    pub fn remove(&self, id: i32) {
        self.handles.borrow_mut().remove(&id);
    }

    /// Number of live registered handles
    pub fn count(&self) -> usize {
        let mut handles = self.handles.borrow_mut();
        handles.retain(|_, weak| weak.upgrade().is_some());
        handles.len()
    }

    /// Run one tick: wait for readiness, dispatch callbacks, prune.
    ///
    /// Blocks up to `timeout` (indefinitely when `None`) and returns the
    /// number of handles dispatched this tick. Callback errors never
    /// surface here; only a failed poll does.
    pub fn react(&self, timeout: Option<Duration>) -> Result<usize> {
        // Snapshot live, open handles in registry order; prune the rest.
        let snapshot: Vec<(i32, Handle)> = {
            let mut handles = self.handles.borrow_mut();
            let mut live = Vec::with_capacity(handles.len());
            handles.retain(|&id, weak| match weak.upgrade() {
                Some(handle) if handle.borrow().is_open() => {
                    live.push((id, handle));
                    true
                }
                _ => false,
            });
            live
        };

        // Arm every descriptor for this tick only.
        let mut armed: Vec<i32> = Vec::with_capacity(snapshot.len());
        let mut arm_error = None;
        for (id, _) in &snapshot {
            match self.poller.add(*id, PollEvent::readable(*id as usize)) {
                Ok(()) => armed.push(*id),
                Err(e) => {
                    arm_error = Some(e);
                    break;
                }
            }
        }

        let mut events: Vec<PollEvent> = Vec::with_capacity(snapshot.len().max(1));
        let waited = match arm_error {
            None => self.poller.wait(&mut events, timeout),
            Some(_) => Ok(0),
        };

        // Disarm before anything can early-return.
        for id in &armed {
            let _ = self.poller.delete(*id);
        }

        if let Some(e) = arm_error {
            return Err(Error::Io(e));
        }
        match waited {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(Error::Io(e)),
        }

        let ready: BTreeSet<usize> = events.iter().map(|event| event.key).collect();
        if ready.is_empty() {
            return Ok(0);
        }

        let mut dispatched = 0;
        for (id, handle) in snapshot {
            if !ready.contains(&(id as usize)) {
                continue;
            }

            // A callback earlier in this tick may have closed this handle.
            if !handle.borrow().is_open() {
                self.remove(id);
                continue;
            }
            dispatched += 1;

            let mut suppress_readable = false;
            if handle.borrow_mut().out_of_band_pending() {
                let out_of_band_result = handle.borrow_mut().on_out_of_band();
                if let Err(err) = out_of_band_result {
                    tracing::debug!(fd = id, error = %err, "out-of-band callback failed");
                    handle.borrow_mut().on_error(&err);
                    suppress_readable = true;
                }
            }

            if !suppress_readable && handle.borrow().is_open() {
                let readable_result = handle.borrow_mut().on_readable();
                if let Err(err) = readable_result {
                    tracing::debug!(fd = id, error = %err, "readable callback failed");
                    handle.borrow_mut().on_error(&err);
                }
            }

            if !handle.borrow().is_open() {
                self.remove(id);
            }
        }

        Ok(dispatched)
    }
}
