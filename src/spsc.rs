use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

/// Items per chained block. Matches the cadence at which the readers check
/// backpressure, so a producer touches the allocator at most once per
/// backpressure window.
const BLOCK_CAP: usize = 256;

struct Block<T> {
    slots: [UnsafeCell<MaybeUninit<T>>; BLOCK_CAP],
    next: AtomicPtr<Block<T>>,
}

impl<T> Block<T> {
    fn alloc() -> *mut Block<T> {
        Box::into_raw(Box::new(Block {
            slots: std::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
            next: AtomicPtr::new(std::ptr::null_mut()),
        }))
    }
}

/// A wait-free single-producer / single-consumer FIFO of owned items.
///
/// The queue is an unbounded chain of fixed-size blocks: the producer owns
/// the tail block and appends, the consumer owns the head block and frees it
/// once drained. There is no capacity cap; bounding total in-flight memory
/// is the readers' job (they watch [`crate::record::READ_BYTES_IN_MEM`]).
/// The only synchronisation per operation is one release store of the
/// produced index on `produce` and one acquire load of it on `consume`.
///
/// Two latching flags ride along for shutdown: the producer announces it
/// will push nothing more, and the consumer announces it has stopped
/// draining. Neither flag affects the data path.
///
/// Exactly one thread may call the producer operations and exactly one
/// thread the consumer operations; this is a correctness precondition, not
/// something the type system enforces once the queue is shared.
pub struct SpscQueue<T> {
    produced: AtomicUsize,
    consumed: AtomicUsize,
    /// Tail block, touched only by the producer.
    tail: UnsafeCell<*mut Block<T>>,
    /// Head block, touched only by the consumer.
    head: UnsafeCell<*mut Block<T>>,
    producer_finished: AtomicBool,
    consumer_finished: AtomicBool,
}

unsafe impl<T: Send> Send for SpscQueue<T> {}
unsafe impl<T: Send> Sync for SpscQueue<T> {}

impl<T> SpscQueue<T> {
    pub fn new() -> Self {
        let first = Block::alloc();
        SpscQueue {
            produced: AtomicUsize::new(0),
            consumed: AtomicUsize::new(0),
            tail: UnsafeCell::new(first),
            head: UnsafeCell::new(first),
            producer_finished: AtomicBool::new(false),
            consumer_finished: AtomicBool::new(false),
        }
    }

    /// Append an item. Never blocks; allocates a new block every
    /// `BLOCK_CAP` items. Producer side only.
    pub fn produce(&self, item: T) {
        let p = self.produced.load(Ordering::Relaxed);
        let slot = p % BLOCK_CAP;
        unsafe {
            let mut tail = *self.tail.get();
            if slot == 0 && p != 0 {
                let fresh = Block::alloc();
                // link before publishing `produced`, so a consumer that
                // observes item `p` can always follow `next`
                (*tail).next.store(fresh, Ordering::Release);
                tail = fresh;
                *self.tail.get() = tail;
            }
            (*(*tail).slots[slot].get()).write(item);
        }
        self.produced.store(p + 1, Ordering::Release);
    }

    /// Take the next item, or `None` when the queue is currently empty.
    /// Never blocks. Consumer side only.
    pub fn consume(&self) -> Option<T> {
        let c = self.consumed.load(Ordering::Relaxed);
        if c == self.produced.load(Ordering::Acquire) {
            return None;
        }
        let slot = c % BLOCK_CAP;
        unsafe {
            let mut head = *self.head.get();
            if slot == 0 && c != 0 {
                let next = (*head).next.load(Ordering::Acquire);
                drop(Box::from_raw(head));
                head = next;
                *self.head.get() = head;
            }
            let item = (*(*head).slots[slot].get()).assume_init_read();
            self.consumed.store(c + 1, Ordering::Release);
            Some(item)
        }
    }

    /// True when at least one item is visible to the consumer.
    pub fn can_be_consumed(&self) -> bool {
        self.consumed.load(Ordering::Relaxed) < self.produced.load(Ordering::Acquire)
    }

    pub fn set_producer_finished(&self) {
        self.producer_finished.store(true, Ordering::Release);
    }

    pub fn is_producer_finished(&self) -> bool {
        self.producer_finished.load(Ordering::Acquire)
    }

    pub fn set_consumer_finished(&self) {
        self.consumer_finished.store(true, Ordering::Release);
    }

    pub fn is_consumer_finished(&self) -> bool {
        self.consumer_finished.load(Ordering::Acquire)
    }
}

impl<T> Drop for SpscQueue<T> {
    fn drop(&mut self) {
        // drop whatever was never consumed, then the final block
        while self.consume().is_some() {}
        unsafe {
            drop(Box::from_raw(*self.head.get()));
        }
    }
}
