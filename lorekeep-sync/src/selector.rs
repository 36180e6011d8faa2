//! Round-robin campaign selection.
//!
//! Both workers draw their per-pass campaign batch from one shared selector,
//! so a bounded cap still reaches every tracked campaign over successive
//! passes.

use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct SelectorState {
    /// Campaign IDs as last observed by `select`
    campaign_ids: Vec<String>,
    /// Where the next bounded selection starts
    next_offset: usize,
}

/// Fair, bounded selection over a changing list of campaign IDs.
///
/// Given a stable list of `N` IDs and a cap `c`, `ceil(N / c)` consecutive
/// calls visit every ID at least once, and no ID is visited twice before all
/// others have been visited.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    state: Mutex<SelectorState>,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SelectorState> {
        // The state is two plain values; a panic mid-update cannot break it.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Select up to `cap` IDs starting at the stored offset, wrapping around.
    ///
    /// A `cap` of 0, or one at least as large as the list, returns the whole
    /// list unchanged and leaves the offset alone.
    pub fn select(&self, campaign_ids: &[String], cap: usize) -> Vec<String> {
        let mut state = self.lock();
        state.campaign_ids = campaign_ids.to_vec();

        let len = campaign_ids.len();
        if cap == 0 || cap >= len {
            return campaign_ids.to_vec();
        }

        // The list may have shrunk since the last call.
        let start = state.next_offset % len;
        let selected = campaign_ids
            .iter()
            .cycle()
            .skip(start)
            .take(cap)
            .cloned()
            .collect();
        state.next_offset = (start + cap) % len;
        selected
    }

    /// Offset the next bounded selection starts from.
    pub fn offset(&self) -> usize {
        self.lock().next_offset
    }

    /// Number of campaigns seen by the most recent selection.
    pub fn last_observed_len(&self) -> usize {
        self.lock().campaign_ids.len()
    }
}
