//! Channels
//!
//! A bounded FIFO of Values guarded by a mutex with `not_empty` and
//! `not_full` conditions. Capacity 0 makes an unbuffered channel: the value
//! waits in a single slot and the sender returns only once a receiver has
//! taken it. Receiving from a closed, drained channel yields null.

use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::convert::expect_int;
use crate::error::{RtError, RtResult};
use crate::exception::{abi_unit, abi_value};
use crate::memory::{self, HeapCell, RcHeader, ReleaseList};
use crate::object;
use crate::value::Value;

static POLL_INTERVAL_MS: AtomicU64 = AtomicU64::new(1);

/// Interval between polling rounds in [`select`].
pub(crate) fn set_poll_interval(ms: u64) {
    POLL_INTERVAL_MS.store(ms.max(1), Ordering::Relaxed);
}

struct ChannelState {
    buf: VecDeque<Value>,
    closed: bool,
    /// Values ever enqueued and dequeued; an unbuffered sender waits for
    /// `received` to reach its own ticket.
    sent: u64,
    received: u64,
}

pub struct ChannelCell {
    pub(crate) header: RcHeader,
    capacity: usize,
    state: Mutex<ChannelState>,
    not_empty: Condvar,
    not_full: Condvar,
    taken: Condvar,
    blocked_sends: AtomicU64,
}

impl HeapCell for ChannelCell {
    fn header(&self) -> &RcHeader {
        &self.header
    }

    fn drain_children(&mut self, out: &mut ReleaseList) {
        let state = self.state.get_mut();
        if !state.buf.is_empty() {
            tracing::warn!(
                buffered = state.buf.len(),
                "channel dropped with values still buffered"
            );
        }
        out.extend(state.buf.drain(..));
    }
}

impl ChannelCell {
    fn slots(&self) -> usize {
        self.capacity.max(1)
    }

    fn is_unbuffered(&self) -> bool {
        self.capacity == 0
    }

    /// Dequeue under the lock, waking senders.
    fn take_locked(&self, state: &mut ChannelState) -> Option<Value> {
        let value = state.buf.pop_front()?;
        state.received += 1;
        self.not_full.notify_one();
        if self.is_unbuffered() {
            self.taken.notify_all();
        }
        Some(value)
    }

    fn enqueue_locked(&self, state: &mut ChannelState, value: Value) -> u64 {
        value.retain();
        state.buf.push_back(value);
        state.sent += 1;
        self.not_empty.notify_one();
        state.sent
    }

    /// Wait on `cond` while `blocked` holds. Returns false on timeout.
    fn wait_while(
        cond: &Condvar,
        state: &mut MutexGuard<'_, ChannelState>,
        deadline: Option<Instant>,
        blocked: impl Fn(&ChannelState) -> bool,
    ) -> bool {
        while blocked(&**state) {
            match deadline {
                Some(deadline) => {
                    if cond.wait_until(state, deadline).timed_out() && blocked(&**state) {
                        return false;
                    }
                }
                None => cond.wait(state),
            }
        }
        true
    }

    fn send(&self, value: Value, deadline: Option<Instant>) -> RtResult<bool> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(RtError::closed_channel());
        }
        let slots = self.slots();
        if state.buf.len() >= slots {
            self.blocked_sends.fetch_add(1, Ordering::Relaxed);
            let room = Self::wait_while(&self.not_full, &mut state, deadline, |s| {
                s.buf.len() >= slots && !s.closed
            });
            if !room {
                return Ok(false);
            }
            if state.closed {
                return Err(RtError::closed_channel());
            }
        }
        let ticket = self.enqueue_locked(&mut state, value);
        if !self.is_unbuffered() {
            return Ok(true);
        }

        let in_time = Self::wait_while(&self.taken, &mut state, deadline, |s| {
            s.received < ticket && !s.closed
        });
        if state.received >= ticket {
            return Ok(true);
        }
        // Nobody took the value: withdraw it.
        if let Some(ours) = state.buf.pop_back() {
            state.sent -= 1;
            ours.release();
            self.not_full.notify_one();
        }
        if in_time {
            Err(RtError::closed_channel())
        } else {
            Ok(false)
        }
    }

    fn recv(&self, deadline: Option<Instant>) -> Option<Value> {
        let mut state = self.state.lock();
        let ready = Self::wait_while(&self.not_empty, &mut state, deadline, |s| {
            s.buf.is_empty() && !s.closed
        });
        if !ready {
            return None;
        }
        self.take_locked(&mut state)
    }

    /// Non-blocking probe used by `select`: `Some` when the channel has a
    /// value or is closed.
    fn poll(&self) -> Option<Value> {
        let mut state = self.state.lock();
        match self.take_locked(&mut state) {
            Some(value) => Some(value),
            None if state.closed => Some(Value::Null),
            None => None,
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
        self.taken.notify_all();
    }
}

fn channel_cell<'a>(ch: &'a Value, op: &str) -> RtResult<&'a ChannelCell> {
    match *ch {
        Value::Channel(p) => Ok(unsafe { p.as_ref() }),
        _ => Err(RtError::type_mismatch(format!("{op}() expects a channel"))),
    }
}

fn deadline_after(ms: i64) -> Instant {
    Instant::now() + Duration::from_millis(ms.max(0) as u64)
}

/// A new channel holding up to `capacity` values; 0 makes it unbuffered.
pub fn create(capacity: i64) -> RtResult<Value> {
    let capacity = usize::try_from(capacity)
        .map_err(|_| RtError::range(format!("Channel capacity must be non-negative, got {capacity}")))?;
    let cell = ChannelCell {
        header: RcHeader::new(),
        capacity,
        state: Mutex::new(ChannelState {
            buf: VecDeque::with_capacity(capacity.max(1)),
            closed: false,
            sent: 0,
            received: 0,
        }),
        not_empty: Condvar::new(),
        not_full: Condvar::new(),
        taken: Condvar::new(),
        blocked_sends: AtomicU64::new(0),
    };
    Ok(Value::Channel(memory::alloc_cell(cell)))
}

/// Send `value`, blocking while the channel is full. The channel takes its
/// own reference.
pub fn send(ch: Value, value: Value) -> RtResult<()> {
    channel_cell(&ch, "send")?.send(value, None).map(drop)
}

/// Receive the oldest value, blocking while the channel is empty and open.
pub fn recv(ch: Value) -> RtResult<Value> {
    Ok(channel_cell(&ch, "recv")?.recv(None).unwrap_or(Value::Null))
}

/// Like [`send`], giving up after `ms` milliseconds. Returns whether the
/// value was sent.
pub fn send_timeout(ch: Value, value: Value, ms: i64) -> RtResult<bool> {
    channel_cell(&ch, "send_timeout")?.send(value, Some(deadline_after(ms)))
}

/// Like [`recv`], yielding null after `ms` milliseconds.
pub fn recv_timeout(ch: Value, ms: i64) -> RtResult<Value> {
    Ok(channel_cell(&ch, "recv_timeout")?
        .recv(Some(deadline_after(ms)))
        .unwrap_or(Value::Null))
}

/// Close the channel and wake every waiter.
pub fn close(ch: Value) -> RtResult<()> {
    channel_cell(&ch, "close")?.close();
    Ok(())
}

/// Sends that had to wait for room.
pub fn blocked_sends(ch: Value) -> RtResult<u64> {
    Ok(channel_cell(&ch, "blocked_sends")?
        .blocked_sends
        .load(Ordering::Relaxed))
}

pub fn len(ch: Value) -> RtResult<usize> {
    Ok(channel_cell(&ch, "len")?.state.lock().buf.len())
}

pub fn is_closed(ch: Value) -> RtResult<bool> {
    Ok(channel_cell(&ch, "is_closed")?.state.lock().closed)
}

/// Wait for the first of `channels` (an array) that has a value or is
/// closed, and return `{channel, value}`. A closed channel reports a null
/// value. `timeout_ms` of `None` waits forever; on timeout the result is
/// null.
pub fn select(channels: Value, timeout_ms: Option<i64>) -> RtResult<Value> {
    let arr = channels.as_array_cell().ok_or_else(|| {
        RtError::type_mismatch("select() expects array of channels as first argument")
    })?;
    let chans = arr.to_vec_raw();
    if chans.is_empty() {
        return Err(RtError::runtime("select() requires at least one channel"));
    }
    if chans.iter().any(|c| !matches!(c, Value::Channel(_))) {
        return Err(RtError::type_mismatch(
            "select() array must contain only channels",
        ));
    }

    let deadline = timeout_ms.map(deadline_after);
    let interval = Duration::from_millis(POLL_INTERVAL_MS.load(Ordering::Relaxed));
    loop {
        for ch in &chans {
            let cell = channel_cell(ch, "select")?;
            if let Some(value) = cell.poll() {
                let result = Value::object();
                object::set_field(result, "channel", *ch)?;
                object::set_field(result, "value", value)?;
                value.release();
                return Ok(result);
            }
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(Value::Null);
        }
        std::thread::sleep(interval);
    }
}

// =============================================================================
// C ABI
// =============================================================================

fn timeout_arg(timeout: Value, op: &str) -> RtResult<i64> {
    expect_int(timeout, op)
}

/// Signature: `(i32) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_channel(capacity: i32) -> Value {
    abi_value(create(capacity as i64))
}

/// Signature: `(Value, Value) -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_channel_send(ch: Value, value: Value) {
    abi_unit(send(ch, value));
}

/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_channel_recv(ch: Value) -> Value {
    abi_value(recv(ch))
}

/// Signature: `(Value, Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_channel_send_timeout(ch: Value, value: Value, timeout: Value) -> Value {
    abi_value(
        timeout_arg(timeout, "send_timeout")
            .and_then(|ms| send_timeout(ch, value, ms))
            .map(Value::Bool),
    )
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_channel_recv_timeout(ch: Value, timeout: Value) -> Value {
    abi_value(timeout_arg(timeout, "recv_timeout").and_then(|ms| recv_timeout(ch, ms)))
}

/// Signature: `(Value) -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_channel_close(ch: Value) {
    abi_unit(close(ch));
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_select(channels: Value, timeout: Value) -> Value {
    let timeout = if timeout.is_null() {
        Ok(None)
    } else {
        timeout_arg(timeout, "select").map(Some)
    };
    abi_value(timeout.and_then(|ms| select(channels, ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array;
    use crate::error::RtErrorKind;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_fifo_and_close() {
        let ch = create(4).unwrap();
        for i in 1..=3 {
            send(ch, Value::I32(i)).unwrap();
        }
        close(ch).unwrap();
        let err = send(ch, Value::I32(9)).unwrap_err();
        assert!(matches!(err.kind(), RtErrorKind::ClosedChannel));
        for i in 1..=3 {
            assert!(matches!(recv(ch).unwrap(), Value::I32(v) if v == i));
        }
        assert!(recv(ch).unwrap().is_null());
        assert!(is_closed(ch).unwrap());
        ch.release();
    }

    #[test]
    fn test_channel_holds_its_own_reference() {
        let ch = create(1).unwrap();
        let s = Value::string_from("msg");
        send(ch, s).unwrap();
        assert_eq!(s.refcount(), 2);
        s.release();
        let got = recv(ch).unwrap();
        assert_eq!(got.as_str(), Some("msg"));
        assert_eq!(got.refcount(), 1);
        got.release();
        ch.release();
    }

    #[test]
    fn test_full_channel_blocks_sender_once() {
        let ch = create(2).unwrap();
        ch.retain();
        let producer = std::thread::spawn(move || {
            for i in 0..3 {
                send(ch, Value::I32(i)).unwrap();
            }
            ch.release();
        });
        while blocked_sends(ch).unwrap() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        for i in 0..3 {
            assert!(matches!(recv(ch).unwrap(), Value::I32(v) if v == i));
        }
        producer.join().unwrap();
        assert_eq!(blocked_sends(ch).unwrap(), 1);
        ch.release();
    }

    #[test]
    fn test_unbuffered_send_waits_for_receiver() {
        let ch = create(0).unwrap();
        ch.retain();
        let done = Arc::new(AtomicBool::new(false));
        let sender_done = Arc::clone(&done);
        let sender = std::thread::spawn(move || {
            send(ch, Value::I32(42)).unwrap();
            sender_done.store(true, Ordering::SeqCst);
            ch.release();
        });
        std::thread::sleep(Duration::from_millis(30));
        assert!(!done.load(Ordering::SeqCst));
        assert!(matches!(recv(ch).unwrap(), Value::I32(42)));
        sender.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        ch.release();
    }

    #[test]
    fn test_timeouts() {
        let ch = create(1).unwrap();
        assert!(recv_timeout(ch, 10).unwrap().is_null());
        assert!(send_timeout(ch, Value::I32(1), 10).unwrap());
        assert!(!send_timeout(ch, Value::I32(2), 10).unwrap());
        assert!(matches!(recv_timeout(ch, 10).unwrap(), Value::I32(1)));
        ch.release();

        let unbuffered = create(0).unwrap();
        assert!(!send_timeout(unbuffered, Value::I32(1), 10).unwrap());
        assert_eq!(len(unbuffered).unwrap(), 0);
        unbuffered.release();
    }

    #[test]
    fn test_select() {
        let a = create(1).unwrap();
        let b = create(1).unwrap();
        let chans = Value::array();
        array::push(chans, a).unwrap();
        array::push(chans, b).unwrap();

        assert!(select(chans, Some(5)).unwrap().is_null());

        send(b, Value::I32(7)).unwrap();
        let picked = select(chans, None).unwrap();
        let from = object::get_field(picked, "channel").unwrap();
        assert!(crate::value::values_equal(from, b));
        assert!(matches!(object::get_field(picked, "value").unwrap(), Value::I32(7)));
        from.release();
        picked.release();

        close(a).unwrap();
        let closed = select(chans, Some(5)).unwrap();
        assert!(object::get_field(closed, "value").unwrap().is_null());
        closed.release();

        let empty = Value::array();
        let err = select(empty, None).unwrap_err();
        assert_eq!(err.to_string(), "select() requires at least one channel");
        for v in [empty, chans, a, b] {
            v.release();
        }
    }

    #[test]
    fn test_negative_capacity() {
        let err = create(-1).unwrap_err();
        assert!(matches!(err.kind(), RtErrorKind::RangeError(_)));
    }
}
