//! Shared-channel request dispatcher
//!
//! A server channel has strict request/reply semantics: one request on
//! the wire at a time, replies in request order. [`SharedChannelSet`]
//! serializes concurrent callers onto such channels. Each handle keeps
//! free, pending and active operation lists as index-linked records in
//! a per-handle arena, so completion recycles records without heap
//! churn.
//!
//! Callbacks run synchronously inside `poll_idle`/`poll_data` and may
//! re-enter the dispatcher, including destroying their own handle; a
//! per-handle reentrancy counter defers the actual release until the
//! outermost callback frame returns.

use crate::common::{time_diff, Timestamp};
use crate::error::{LinkError, Result};

use bytes::Bytes;
use std::cell::Cell;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// Caller-supplied token passed back on completion
pub type UserToken = u32;

/// Sends a request onto the underlying channel
pub type SendFn = Box<dyn FnMut(&[u8]) -> Result<()>>;

/// Parses received bytes into the reply for the active operation
pub type ReceiveFn = Box<dyn FnMut(Bytes) -> Result<Bytes>>;

/// Completion callback: terminal outcome for one operation
pub type CompleteFn = Box<dyn FnMut(&mut SharedChannelSet, UserToken, Result<Bytes>)>;

/// Cooperative cancellation flag for foreground requests
pub type EscapeFlag = Rc<Cell<bool>>;

/// Opaque identifier of a shared server channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedHandle(usize);

const NIL: usize = usize::MAX;

struct OpRecord {
    cmd: Bytes,
    user: UserToken,
    complete: Option<CompleteFn>,
    next: usize,
}

struct HandleState {
    send: SendFn,
    receive: ReceiveFn,

    ops: Vec<OpRecord>,
    free_head: usize,
    pending_head: usize,
    pending_tail: usize,
    active: usize,
    /// Armed on the first tick after promotion, per the timeout rule
    deadline: Option<Timestamp>,

    /// Callback frames currently on the stack for this handle
    threads: u32,
    defer_destroy: bool,
}

impl HandleState {
    fn alloc_op(&mut self, cmd: Bytes, user: UserToken, complete: Option<CompleteFn>) -> usize {
        if self.free_head != NIL {
            let idx = self.free_head;
            self.free_head = self.ops[idx].next;
            let op = &mut self.ops[idx];
            op.cmd = cmd;
            op.user = user;
            op.complete = complete;
            op.next = NIL;
            idx
        } else {
            self.ops.push(OpRecord {
                cmd,
                user,
                complete,
                next: NIL,
            });
            self.ops.len() - 1
        }
    }

    fn push_pending_tail(&mut self, idx: usize) {
        if self.pending_tail == NIL {
            self.pending_head = idx;
            self.pending_tail = idx;
        } else {
            self.ops[self.pending_tail].next = idx;
            self.pending_tail = idx;
        }
    }

    fn push_pending_head(&mut self, idx: usize) {
        self.ops[idx].next = self.pending_head;
        self.pending_head = idx;
        if self.pending_tail == NIL {
            self.pending_tail = idx;
        }
    }

    fn pop_pending_head(&mut self) -> Option<usize> {
        if self.pending_head == NIL {
            return None;
        }
        let idx = self.pending_head;
        self.pending_head = self.ops[idx].next;
        if self.pending_head == NIL {
            self.pending_tail = NIL;
        }
        self.ops[idx].next = NIL;
        Some(idx)
    }

    /// Recycle a detached record, handing back its callback
    fn release_op(&mut self, idx: usize) -> (UserToken, Option<CompleteFn>) {
        let user = self.ops[idx].user;
        let complete = self.ops[idx].complete.take();
        self.ops[idx].cmd = Bytes::new();
        self.ops[idx].next = self.free_head;
        self.free_head = idx;
        (user, complete)
    }
}

/// Dispatch statistics across all handles
#[derive(Debug, Default, Clone)]
pub struct DispatchStats {
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub late_replies_dropped: u64,
}

/// The process-wide set of shared server channels.
///
/// All mutation happens from the poll loop; callback reentrancy is the
/// only recursion and is guarded per handle.
pub struct SharedChannelSet {
    handles: Vec<Option<HandleState>>,
    request_timeout_ms: u32,
    stats: DispatchStats,
}

impl SharedChannelSet {
    pub fn new(request_timeout_ms: u32) -> Self {
        Self {
            handles: Vec::new(),
            request_timeout_ms,
            stats: DispatchStats::default(),
        }
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Handles currently alive, for the stack's poll walk
    pub fn handle_ids(&self) -> Vec<SharedHandle> {
        self.handles
            .iter()
            .enumerate()
            .filter_map(|(i, h)| h.as_ref().map(|_| SharedHandle(i)))
            .collect()
    }

    /// Attach a dispatcher to a server channel.
    pub fn create(&mut self, send: SendFn, receive: ReceiveFn) -> SharedHandle {
        let state = HandleState {
            send,
            receive,
            ops: Vec::new(),
            free_head: NIL,
            pending_head: NIL,
            pending_tail: NIL,
            active: NIL,
            deadline: None,
            threads: 0,
            defer_destroy: false,
        };
        for (i, slot) in self.handles.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(state);
                return SharedHandle(i);
            }
        }
        self.handles.push(Some(state));
        SharedHandle(self.handles.len() - 1)
    }

    /// Tear down a handle: every queued operation fails with
    /// `SvrClosed`. The slot is released once no callback frame on the
    /// stack still references it.
    pub fn destroy(&mut self, handle: SharedHandle) -> Result<()> {
        self.fail_all(handle, LinkError::SvrClosed)?;

        let state = self.state_mut(handle)?;
        if state.threads > 0 {
            trace!(handle = handle.0, "destroy deferred to outermost callback");
            state.defer_destroy = true;
        } else {
            self.handles[handle.0] = None;
            debug!(handle = handle.0, "handle destroyed");
        }
        Ok(())
    }

    /// Queue a background request at the tail of the pending list.
    pub fn back(
        &mut self,
        handle: SharedHandle,
        cmd: Bytes,
        user: UserToken,
        complete: CompleteFn,
    ) -> Result<()> {
        let state = self.state_mut(handle)?;
        let idx = state.alloc_op(cmd, user, Some(complete));
        state.push_pending_tail(idx);
        Ok(())
    }

    /// Queue a foreground request at the head of the pending list, so
    /// it overtakes queued background work. The caller drives the poll
    /// loop until `complete` fires; [`SharedChannelSet::fore`] wraps
    /// this for callers that own the pump.
    pub fn fore_enqueue(
        &mut self,
        handle: SharedHandle,
        cmd: Bytes,
        complete: CompleteFn,
    ) -> Result<()> {
        let state = self.state_mut(handle)?;
        let idx = state.alloc_op(cmd, 0, Some(complete));
        state.push_pending_head(idx);
        Ok(())
    }

    /// Run a foreground request: enqueue at the head of the pending
    /// list and drive `pump` until the operation completes.
    ///
    /// With `allow_escape`, a set [`EscapeFlag`] abandons the request
    /// with `Escape`; a late reply for it is dropped.
    pub fn fore<F>(
        &mut self,
        handle: SharedHandle,
        cmd: Bytes,
        allow_escape: bool,
        escape: &EscapeFlag,
        mut pump: F,
    ) -> Result<Bytes>
    where
        F: FnMut(&mut SharedChannelSet) -> Result<()>,
    {
        let outcome: Rc<Cell<Option<Result<Bytes>>>> = Rc::new(Cell::new(None));
        let cell = outcome.clone();
        self.fore_enqueue(
            handle,
            cmd,
            Box::new(move |_, _, result| {
                cell.set(Some(result));
            }),
        )?;

        loop {
            if let Some(result) = outcome.take() {
                return result;
            }
            if allow_escape && escape.get() {
                self.abandon(handle)?;
                return Err(LinkError::Escape);
            }
            pump(self)?;
        }
    }

    /// Fail the active operation and the whole pending queue with
    /// `err`, active first. The handle itself stays usable; the link
    /// owner calls this when the link drops so every waiter learns the
    /// terminal reason at once.
    pub fn fail_all(&mut self, handle: SharedHandle, err: LinkError) -> Result<()> {
        loop {
            let idx = {
                let state = self.state_mut(handle)?;
                if state.active != NIL {
                    let idx = state.active;
                    state.active = NIL;
                    state.deadline = None;
                    idx
                } else if let Some(idx) = state.pop_pending_head() {
                    idx
                } else {
                    break;
                }
            };
            self.finish_op(handle, idx, Err(err.clone()));
        }
        Ok(())
    }

    /// Fail only the active operation, if there is one. Used when its
    /// request could not be placed on the wire.
    pub fn fail_active(&mut self, handle: SharedHandle, err: LinkError) -> Result<()> {
        let idx = {
            let state = self.state_mut(handle)?;
            if state.active == NIL {
                return Ok(());
            }
            let idx = state.active;
            state.active = NIL;
            state.deadline = None;
            idx
        };
        self.finish_op(handle, idx, Err(err));
        Ok(())
    }

    /// Drop the current foreground operation after an escape; a late
    /// reply for it will be discarded.
    pub fn abandon(&mut self, handle: SharedHandle) -> Result<()> {
        let idx = {
            let state = self.state_mut(handle)?;
            if state.active != NIL {
                let idx = state.active;
                state.active = NIL;
                state.deadline = None;
                Some(idx)
            } else {
                state.pop_pending_head()
            }
        };
        if let Some(idx) = idx {
            let state = self.state_mut(handle)?;
            let _ = state.release_op(idx);
        }
        Ok(())
    }

    /// Idle tick: promote the next pending operation or enforce the
    /// deadline of the active one.
    pub fn poll_idle(&mut self, handle: SharedHandle, now: Timestamp) -> Result<()> {
        enum Action {
            None,
            SendFailed(usize, LinkError),
            TimedOut(usize),
        }

        let action = {
            let timeout = self.request_timeout_ms;
            let state = self.state_mut(handle)?;
            if state.active == NIL {
                match state.pop_pending_head() {
                    Some(idx) => {
                        state.active = idx;
                        state.deadline = None;
                        let cmd = state.ops[idx].cmd.clone();
                        trace!(handle = handle.0, "operation promoted");
                        match (state.send)(&cmd) {
                            Ok(()) => Action::None,
                            Err(e) => {
                                state.active = NIL;
                                Action::SendFailed(idx, e)
                            }
                        }
                    }
                    None => Action::None,
                }
            } else {
                match state.deadline {
                    // The clock starts the first tick after promotion
                    None => {
                        state.deadline = Some(now.wrapping_add(timeout));
                        Action::None
                    }
                    Some(deadline) if time_diff(now, deadline) >= 0 => {
                        let idx = state.active;
                        state.active = NIL;
                        state.deadline = None;
                        Action::TimedOut(idx)
                    }
                    Some(_) => Action::None,
                }
            }
        };

        match action {
            Action::None => Ok(()),
            Action::SendFailed(idx, e) => {
                self.finish_op(handle, idx, Err(e));
                Ok(())
            }
            Action::TimedOut(idx) => {
                warn!(handle = handle.0, "request timed out");
                self.stats.timed_out += 1;
                self.finish_op(handle, idx, Err(LinkError::SvrTime));
                Ok(())
            }
        }
    }

    /// Feed received bytes to the active operation's reply parser and
    /// complete it. Bytes arriving with no active operation are a late
    /// reply and are dropped.
    pub fn poll_data(&mut self, handle: SharedHandle, bytes: Bytes) -> Result<()> {
        let (idx, outcome) = {
            let state = self.state_mut(handle)?;
            if state.active == NIL {
                self.stats.late_replies_dropped += 1;
                trace!(handle = handle.0, "late reply dropped");
                return Ok(());
            }
            let idx = state.active;
            state.active = NIL;
            state.deadline = None;
            let outcome = (state.receive)(bytes);
            (idx, outcome)
        };

        self.finish_op(handle, idx, outcome);
        Ok(())
    }

    /// Whether the handle has no active or pending work
    pub fn is_idle(&self, handle: SharedHandle) -> bool {
        match self.handles.get(handle.0).and_then(|s| s.as_ref()) {
            Some(state) => state.active == NIL && state.pending_head == NIL,
            None => true,
        }
    }

    /// Complete one detached operation: recycle its record, then run
    /// its callback under the reentrancy guard.
    fn finish_op(&mut self, handle: SharedHandle, idx: usize, outcome: Result<Bytes>) {
        match outcome {
            Ok(_) => self.stats.completed += 1,
            Err(_) => self.stats.failed += 1,
        }

        let (user, complete) = {
            let state = match self.handles[handle.0].as_mut() {
                Some(s) => s,
                None => return,
            };
            let pair = state.release_op(idx);
            state.threads += 1;
            pair
        };

        if let Some(mut complete) = complete {
            complete(self, user, outcome);
        }

        if let Some(state) = self.handles[handle.0].as_mut() {
            state.threads -= 1;
            if state.defer_destroy && state.threads == 0 {
                self.handles[handle.0] = None;
                debug!(handle = handle.0, "deferred destroy completed");
            }
        }
    }

    /// A slot that was never allocated is `SvrNone`; an allocated slot
    /// that has been destroyed is `SvrClosed`.
    fn state_mut(&mut self, handle: SharedHandle) -> Result<&mut HandleState> {
        if handle.0 >= self.handles.len() {
            return Err(LinkError::SvrNone);
        }
        self.handles[handle.0].as_mut().ok_or(LinkError::SvrClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    type Log = Rc<RefCell<Vec<u32>>>;

    fn make_handle(set: &mut SharedChannelSet, sent: Log) -> SharedHandle {
        let send_log = sent;
        set.create(
            Box::new(move |cmd| {
                send_log.borrow_mut().push(cmd[0] as u32);
                Ok(())
            }),
            Box::new(|bytes| Ok(bytes)),
        )
    }

    #[test]
    fn test_promotion_sends_and_completes() {
        let sent: Log = Rc::new(RefCell::new(Vec::new()));
        let mut set = SharedChannelSet::new(30_000);
        let handle = make_handle(&mut set, sent.clone());

        let done: Log = Rc::new(RefCell::new(Vec::new()));
        let done2 = done.clone();
        set.back(
            handle,
            Bytes::from_static(&[9]),
            42,
            Box::new(move |_, user, result| {
                assert!(result.is_ok());
                done2.borrow_mut().push(user);
            }),
        )
        .unwrap();

        set.poll_idle(handle, 0).unwrap();
        assert_eq!(sent.borrow().as_slice(), &[9]);

        set.poll_data(handle, Bytes::from_static(&[1])).unwrap();
        assert_eq!(done.borrow().as_slice(), &[42]);
        assert!(set.is_idle(handle));
    }

    #[test]
    fn test_at_most_one_active() {
        let sent: Log = Rc::new(RefCell::new(Vec::new()));
        let mut set = SharedChannelSet::new(30_000);
        let handle = make_handle(&mut set, sent.clone());

        for id in 0..3u8 {
            set.back(handle, Bytes::from(vec![id]), id as u32, Box::new(|_, _, _| {}))
                .unwrap();
        }

        set.poll_idle(handle, 0).unwrap();
        set.poll_idle(handle, 1).unwrap();
        set.poll_idle(handle, 2).unwrap();
        // Only the first went on the wire
        assert_eq!(sent.borrow().as_slice(), &[0]);
    }

    #[test]
    fn test_timeout_starts_after_promotion() {
        let sent: Log = Rc::new(RefCell::new(Vec::new()));
        let mut set = SharedChannelSet::new(30_000);
        let handle = make_handle(&mut set, sent);

        let failures: Log = Rc::new(RefCell::new(Vec::new()));
        let f2 = failures.clone();
        set.back(
            handle,
            Bytes::from_static(&[1]),
            7,
            Box::new(move |_, user, result| {
                assert_eq!(result, Err(LinkError::SvrTime));
                f2.borrow_mut().push(user);
            }),
        )
        .unwrap();

        // Promotion at t=1000; deadline armed on the next tick
        set.poll_idle(handle, 1_000).unwrap();
        set.poll_idle(handle, 2_000).unwrap();
        // 29.9s after arming: not yet
        set.poll_idle(handle, 31_900).unwrap();
        assert!(failures.borrow().is_empty());
        // Past the deadline
        set.poll_idle(handle, 32_000).unwrap();
        assert_eq!(failures.borrow().as_slice(), &[7]);

        // A late reply is dropped without effect
        set.poll_data(handle, Bytes::from_static(&[1])).unwrap();
        assert_eq!(set.stats().late_replies_dropped, 1);
        assert_eq!(failures.borrow().len(), 1);
    }

    #[test]
    fn test_free_list_reuse() {
        let sent: Log = Rc::new(RefCell::new(Vec::new()));
        let mut set = SharedChannelSet::new(30_000);
        let handle = make_handle(&mut set, sent);

        for round in 0..10u8 {
            set.back(handle, Bytes::from(vec![round]), round as u32, Box::new(|_, _, _| {}))
                .unwrap();
            set.poll_idle(handle, round as Timestamp).unwrap();
            set.poll_data(handle, Bytes::from_static(&[0])).unwrap();
        }
        // One record serviced all ten sequential operations
        let state = set.handles[0].as_ref().unwrap();
        assert_eq!(state.ops.len(), 1);
    }

    #[test]
    fn test_fail_all_reports_reason_and_keeps_handle() {
        let sent: Log = Rc::new(RefCell::new(Vec::new()));
        let mut set = SharedChannelSet::new(30_000);
        let handle = make_handle(&mut set, sent.clone());

        let outcomes: Rc<RefCell<Vec<Result<Bytes>>>> = Rc::new(RefCell::new(Vec::new()));
        for id in 0..3u8 {
            let o = outcomes.clone();
            set.back(
                handle,
                Bytes::from(vec![id]),
                id as u32,
                Box::new(move |_, _, result| o.borrow_mut().push(result)),
            )
            .unwrap();
        }
        set.poll_idle(handle, 0).unwrap();

        set.fail_all(handle, LinkError::Comms).unwrap();
        {
            let outcomes = outcomes.borrow();
            assert_eq!(outcomes.len(), 3);
            assert!(outcomes.iter().all(|o| *o == Err(LinkError::Comms)));
        }

        // The handle survives and services new work
        set.back(handle, Bytes::from_static(&[9]), 9, Box::new(|_, _, _| {}))
            .unwrap();
        set.poll_idle(handle, 10).unwrap();
        assert_eq!(sent.borrow().as_slice(), &[0, 9]);
    }

    #[test]
    fn test_destroy_fails_pending() {
        let sent: Log = Rc::new(RefCell::new(Vec::new()));
        let mut set = SharedChannelSet::new(30_000);
        let handle = make_handle(&mut set, sent);

        let outcomes: Rc<RefCell<Vec<Result<Bytes>>>> = Rc::new(RefCell::new(Vec::new()));
        for id in 0..2u8 {
            let o = outcomes.clone();
            set.back(
                handle,
                Bytes::from(vec![id]),
                id as u32,
                Box::new(move |_, _, result| o.borrow_mut().push(result)),
            )
            .unwrap();
        }

        set.destroy(handle).unwrap();
        let outcomes = outcomes.borrow();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| *o == Err(LinkError::SvrClosed)));
        // The slot is gone
        assert!(set.poll_idle(handle, 0).is_err());
    }
}
