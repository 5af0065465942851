use std::sync::atomic::{AtomicU32, Ordering};

/// Shared claim counter of a persistent launch.
#[derive(Debug, Default)]
pub struct TileCounter {
    next: AtomicU32,
}

impl TileCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the next unassigned slot.
    pub fn claim(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) as usize
    }

    #[cfg(test)]
    pub(crate) fn claimed(&self) -> usize {
        self.next.load(Ordering::Relaxed) as usize
    }
}
