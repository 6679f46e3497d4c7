//! Lock-free single-producer/single-consumer frame ring.
//!
//! [`frame_ring`] hands out the two halves of one ring. Neither half is
//! `Clone`, so there is exactly one [`Producer`] and one [`Consumer`]:
//! - The producer runs from the receive interrupt and only ever writes the
//!   slot at `head` before publishing the new head. It takes `&self` because
//!   interrupts arrive through shared references; a push that finds another
//!   push in flight is treated as a drop instead of racing it.
//! - The consumer runs from the poll loop and only ever moves `tail`. Every
//!   call that moves `tail` takes `&mut self`.
//!
//! One slot is always kept free to tell "full" apart from "empty": a ring of
//! capacity `C` holds at most `C - 1` frames.

use crate::frame::Frame;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Active slot count used by the proxy.
pub const DEFAULT_CAPACITY: usize = 20;

/// Smallest usable capacity (one live slot plus the discriminator).
pub const MIN_CAPACITY: usize = 2;

/// Largest capacity a ring is built with.
pub const MAX_CAPACITY: usize = 1024;

struct Shared {
    slots: Box<[UnsafeCell<Frame>]>,
    /// Next slot the producer writes
    head: AtomicUsize,
    /// Next slot the consumer reads
    tail: AtomicUsize,
}

// SAFETY: `Shared` is only reachable through one `Producer` and one
// `Consumer`. A slot is written only by the producer, under its `pushing`
// flag, while the slot lies outside the live region [tail, head). The
// consumer reads slots only inside it, and moves `tail` only through
// `&mut Consumer`. The Release store of `head` publishes a slot write; the
// Release store of `tail` hands a slot back.
unsafe impl Sync for Shared {}

impl Shared {
    fn next(&self, index: usize) -> usize {
        (index + 1) % self.slots.len()
    }

    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (head + self.slots.len() - tail) % self.slots.len()
    }
}

/// Writing half, owned by the interrupt side.
pub struct Producer {
    shared: Arc<Shared>,
    pushing: AtomicBool,
}

/// Reading half, owned by the poll loop.
pub struct Consumer {
    shared: Arc<Shared>,
}

/// Create a ring with `capacity` slots, clamped to
/// [`MIN_CAPACITY`]..=[`MAX_CAPACITY`].
#[must_use]
pub fn frame_ring(capacity: usize) -> (Producer, Consumer) {
    let capacity = capacity.clamp(MIN_CAPACITY, MAX_CAPACITY);
    let slots: Vec<UnsafeCell<Frame>> =
        (0..capacity).map(|_| UnsafeCell::new(Frame::EMPTY)).collect();
    let shared = Arc::new(Shared {
        slots: slots.into_boxed_slice(),
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });
    (
        Producer {
            shared: Arc::clone(&shared),
            pushing: AtomicBool::new(false),
        },
        Consumer { shared },
    )
}

impl Producer {
    /// Store `frame` unless the ring is full or another push is in flight.
    ///
    /// Returns `false` when the frame was dropped; existing contents are never
    /// overwritten.
    pub fn push(&self, frame: Frame) -> bool {
        if self
            .pushing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }

        let shared = &self.shared;
        let head = shared.head.load(Ordering::Acquire);
        let next_head = shared.next(head);
        let accepted = next_head != shared.tail.load(Ordering::Acquire);
        if accepted {
            // SAFETY: `head` is outside the live region and the `pushing` flag
            // makes this the only writer.
            unsafe {
                *shared.slots[head].get() = frame;
            }
            shared.head.store(next_head, Ordering::Release);
        }

        self.pushing.store(false, Ordering::Release);
        accepted
    }
}

impl Consumer {
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    /// Remove and return the oldest frame.
    pub fn pop(&mut self) -> Option<Frame> {
        let shared = &self.shared;
        let tail = shared.tail.load(Ordering::Relaxed);
        if tail == shared.head.load(Ordering::Acquire) {
            return None;
        }

        // SAFETY: `tail` is inside the live region published by the producer.
        let frame = unsafe { *shared.slots[tail].get() };
        shared.tail.store(shared.next(tail), Ordering::Release);
        Some(frame)
    }

    /// Copy the most recently pushed frame without removing it.
    #[must_use]
    pub fn peek_latest(&self) -> Option<Frame> {
        let shared = &self.shared;
        let head = shared.head.load(Ordering::Acquire);
        if shared.tail.load(Ordering::Relaxed) == head {
            return None;
        }

        let last = (head + shared.slots.len() - 1) % shared.slots.len();
        // SAFETY: `last` is the newest live slot; the producer cannot reuse it
        // until `tail` moves past it, which needs `&mut self`.
        Some(unsafe { *shared.slots[last].get() })
    }

    /// Discard everything currently buffered.
    ///
    /// Only `tail` moves, so a frame the producer publishes concurrently is
    /// either discarded with the rest or kept whole.
    pub fn clear(&mut self) {
        let head = self.shared.head.load(Ordering::Acquire);
        self.shared.tail.store(head, Ordering::Release);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.len() == 0
    }

    /// Number of frames currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    /// Raw (head, tail) indices for the statistics dump.
    #[must_use]
    pub fn indices(&self) -> (usize, usize) {
        (
            self.shared.head.load(Ordering::Relaxed),
            self.shared.tail.load(Ordering::Relaxed),
        )
    }
}
