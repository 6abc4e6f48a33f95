//! Batch-fetch sizes and identifier padding.
//!
//! Batched loads only ever use a fixed ladder of statement sizes so the number of distinct
//! SQL shapes stays small. A request for `n` identifiers picks the smallest size that fits and
//! pads the identifier list with a real identifier, producing harmless duplicate matches.

use unitflow_core::Value;

/// The ladder of statement sizes for one maximum batch size.
///
/// `max, max/2, ...` while the halves stay above ten, then `10, 9, ..., 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSizes(Vec<usize>);

impl BatchSizes {
    pub fn new(max_batch_size: usize) -> Self {
        let mut sizes = Vec::new();
        let mut size = max_batch_size.max(1);
        loop {
            sizes.push(size);
            if size <= 1 {
                break;
            }
            size = next_batch_size(size);
        }
        Self(sizes)
    }

    /// Sizes in descending order.
    pub fn sizes(&self) -> &[usize] {
        &self.0
    }

    pub fn max(&self) -> usize {
        self.0[0]
    }

    /// Smallest size that holds `count` identifiers, or the largest size.
    pub fn choose(&self, count: usize) -> usize {
        self.0
            .iter()
            .rev()
            .copied()
            .find(|&size| size >= count)
            .unwrap_or(self.0[0])
    }

    /// Pad `ids` to the chosen statement size with the first identifier.
    ///
    /// Lists longer than the maximum are returned unchanged; callers split them first.
    pub fn pad(&self, mut ids: Vec<Value>) -> Vec<Value> {
        let size = self.choose(ids.len());
        if let Some(first) = ids.first().cloned() {
            while ids.len() < size {
                ids.push(first.clone());
            }
        }
        ids
    }

    /// Split `ids` into padded chunks no larger than the maximum size.
    pub fn chunks(&self, ids: Vec<Value>) -> Vec<Vec<Value>> {
        let max = self.max();
        let mut chunks = Vec::new();
        let mut rest = ids;
        while !rest.is_empty() {
            let tail = if rest.len() > max {
                rest.split_off(max)
            } else {
                Vec::new()
            };
            chunks.push(self.pad(rest));
            rest = tail;
        }
        chunks
    }
}

fn next_batch_size(size: usize) -> usize {
    if size <= 10 {
        size - 1
    } else if size / 2 < 10 {
        10
    } else {
        size / 2
    }
}
