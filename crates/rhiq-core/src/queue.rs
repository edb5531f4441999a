use std::fmt;

use serde::{Deserialize, Serialize};

/// Independent hardware submission timeline.
///
/// Ordering is only ever guaranteed within one queue type; Graphics, Compute
/// and Copy complete independently of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    Graphics,
    Compute,
    Copy,
}

impl QueueType {
    pub const COUNT: usize = 3;

    pub const ALL: [QueueType; QueueType::COUNT] =
        [QueueType::Graphics, QueueType::Compute, QueueType::Copy];

    /// Slot of this queue type in per-queue tables.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            QueueType::Graphics => 0,
            QueueType::Compute => 1,
            QueueType::Copy => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            QueueType::Graphics => "graphics",
            QueueType::Compute => "compute",
            QueueType::Copy => "copy",
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed table holding one `T` per queue type.
#[derive(Debug, Clone, Default)]
pub struct PerQueue<T> {
    slots: [T; QueueType::COUNT],
}

impl<T> PerQueue<T> {
    pub fn from_fn(mut f: impl FnMut(QueueType) -> T) -> Self {
        Self {
            slots: QueueType::ALL.map(&mut f),
        }
    }

    pub fn get(&self, queue: QueueType) -> &T {
        &self.slots[queue.index()]
    }

    pub fn get_mut(&mut self, queue: QueueType) -> &mut T {
        &mut self.slots[queue.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (QueueType, &T)> {
        QueueType::ALL.into_iter().zip(self.slots.iter())
    }
}

impl<T> std::ops::Index<QueueType> for PerQueue<T> {
    type Output = T;

    fn index(&self, queue: QueueType) -> &T {
        self.get(queue)
    }
}

impl<T> std::ops::IndexMut<QueueType> for PerQueue<T> {
    fn index_mut(&mut self, queue: QueueType) -> &mut T {
        self.get_mut(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices_are_dense() {
        for (i, q) in QueueType::ALL.iter().enumerate() {
            assert_eq!(q.index(), i);
        }
    }

    #[test]
    fn test_per_queue_from_fn() {
        let table = PerQueue::from_fn(|q| q.name().len());
        assert_eq!(table[QueueType::Graphics], 8);
        assert_eq!(table[QueueType::Copy], 4);
        assert_eq!(table.iter().count(), QueueType::COUNT);
    }
}
