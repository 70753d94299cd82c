use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Single-producer / single-consumer ring buffer of mono i16 PCM samples.
///
/// The emulation thread produces, the host audio sink consumes; coordination
/// is atomics only. The ring is *lossy* when full: new pushes are dropped.
pub struct PcmProducer {
    inner: Arc<Inner>,
}

#[derive(Clone)]
pub struct PcmConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    // One extra slot so head==tail is unambiguously empty.
    buf: Box<[UnsafeCell<MaybeUninit<i16>>]>,
    cap: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

// Safe because only the producer writes `buf[head]`, only the consumer reads
// `buf[tail]`, and both indices are published through atomics.
unsafe impl Sync for Inner {}
unsafe impl Send for Inner {}

impl Inner {
    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head >= tail {
            head - tail
        } else {
            (self.cap - tail) + head
        }
    }

    #[inline]
    fn next_index(&self, idx: usize) -> usize {
        let next = idx + 1;
        if next == self.cap { 0 } else { next }
    }
}

pub fn pcm_ring(capacity: usize) -> (PcmProducer, PcmConsumer) {
    let cap = capacity.saturating_add(1).max(2);
    let mut buf: Vec<UnsafeCell<MaybeUninit<i16>>> = Vec::with_capacity(cap);
    for _ in 0..cap {
        buf.push(UnsafeCell::new(MaybeUninit::uninit()));
    }

    let inner = Arc::new(Inner {
        buf: buf.into_boxed_slice(),
        cap,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });

    (
        PcmProducer {
            inner: Arc::clone(&inner),
        },
        PcmConsumer { inner },
    )
}

impl PcmProducer {
    /// Push one sample; returns false (sample dropped) when the ring is full.
    #[inline]
    pub fn push(&self, sample: i16) -> bool {
        let head = self.inner.head.load(Ordering::Relaxed);
        let next = self.inner.next_index(head);
        let tail = self.inner.tail.load(Ordering::Acquire);
        if next == tail {
            return false;
        }

        unsafe {
            (*self.inner.buf[head].get()).write(sample);
        }
        self.inner.head.store(next, Ordering::Release);
        true
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PcmConsumer {
    #[inline]
    pub fn pop(&self) -> Option<i16> {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Acquire);
        if tail == head {
            return None;
        }

        let sample = unsafe { (*self.inner.buf[tail].get()).assume_init_read() };
        self.inner.tail.store(self.inner.next_index(tail), Ordering::Release);
        Some(sample)
    }

    /// Drain every buffered sample into a Vec.
    pub fn drain(&self) -> Vec<i16> {
        let mut out = Vec::with_capacity(self.len());
        while let Some(sample) = self.pop() {
            out.push(sample);
        }
        out
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_preserves_order() {
        let (tx, rx) = pcm_ring(4);
        assert!(tx.push(1));
        assert!(tx.push(2));
        assert!(tx.push(3));
        assert_eq!(rx.pop(), Some(1));
        assert_eq!(rx.pop(), Some(2));
        assert_eq!(rx.pop(), Some(3));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn full_ring_drops_newest() {
        let (tx, rx) = pcm_ring(2);
        assert!(tx.push(1));
        assert!(tx.push(2));
        assert!(!tx.push(3));
        assert_eq!(rx.drain(), vec![1, 2]);
    }
}
