//! Weighted round-robin queue
//!
//! Items are pushed into one FIFO per class. `dequeue` serves the current
//! class until its weight is used up, then moves on to the next class.
//! Empty classes are skipped without spending weight, and one call visits
//! each class at most once.
//!
//! ```text
//! weights {A: 2, B: 1}, both classes backlogged
//!
//!   dequeue -> A   (A budget 2 -> 1)
//!   dequeue -> A   (A budget 1 -> 0, advance, B budget = 1)
//!   dequeue -> B   (B budget 1 -> 0, advance, A budget = 2)
//! ```

use metaio_common::{Error, FileClass, Priority, Result};
use std::collections::VecDeque;
use std::marker::PhantomData;

/// A scheduling class with a dense index
pub trait WrrClass: Copy {
    /// Number of classes
    const COUNT: usize;

    /// Index of this class, in `0..COUNT`
    fn index(self) -> usize;
}

impl WrrClass for FileClass {
    const COUNT: usize = Self::ALL.len();

    fn index(self) -> usize {
        self as usize
    }
}

impl WrrClass for Priority {
    const COUNT: usize = Self::ALL.len();

    fn index(self) -> usize {
        self as usize
    }
}

/// Per-class FIFOs drained by weighted round robin
#[derive(Debug)]
pub struct WrrQueue<C: WrrClass, T> {
    queues: Vec<VecDeque<T>>,
    weights: Vec<u32>,
    /// Class currently being served
    current: usize,
    /// Weight left for the current class
    remaining: u32,
    len: usize,
    _class: PhantomData<C>,
}

impl<C: WrrClass, T> WrrQueue<C, T> {
    /// Create a queue with one weight per class
    pub fn new(weights: &[u32]) -> Result<Self> {
        Self::check_weights(weights)?;
        Ok(Self {
            queues: (0..C::COUNT).map(|_| VecDeque::new()).collect(),
            weights: weights.to_vec(),
            current: 0,
            remaining: weights[0],
            len: 0,
            _class: PhantomData,
        })
    }

    fn check_weights(weights: &[u32]) -> Result<()> {
        if weights.len() != C::COUNT {
            return Err(Error::invalid_argument(format!(
                "expected {} weights, got {}",
                C::COUNT,
                weights.len()
            )));
        }
        if weights.contains(&0) {
            return Err(Error::invalid_argument("weights must be positive"));
        }
        Ok(())
    }

    pub fn enqueue(&mut self, item: T, class: C) {
        self.queues[class.index()].push_back(item);
        self.len += 1;
    }

    /// Pop the next item in weighted round-robin order
    pub fn dequeue(&mut self) -> Option<T> {
        for _ in 0..C::COUNT {
            if let Some(item) = self.queues[self.current].pop_front() {
                self.len -= 1;
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.advance();
                }
                return Some(item);
            }
            self.advance();
        }
        None
    }

    fn advance(&mut self) {
        self.current = (self.current + 1) % C::COUNT;
        self.remaining = self.weights[self.current];
    }

    /// Replace the weight vector
    ///
    /// The class being served keeps its current budget; new weights take
    /// effect the next time a budget is refilled.
    pub fn set_weights(&mut self, weights: &[u32]) -> Result<()> {
        Self::check_weights(weights)?;
        self.weights.copy_from_slice(weights);
        Ok(())
    }

    pub fn weights(&self) -> &[u32] {
        &self.weights
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of queued items in one class
    pub fn class_len(&self, class: C) -> usize {
        self.queues[class.index()].len()
    }

    /// Remove every queued item, class by class
    pub fn drain(&mut self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.len);
        for queue in &mut self.queues {
            items.extend(queue.drain(..));
        }
        self.len = 0;
        items
    }
}
