//! Detection of newly appeared map markers.

use std::collections::HashSet;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::listeners::MarkerEvent;
use crate::messages::MapMarker;

#[derive(Debug, Default)]
struct MarkerState {
    persistent_ids: HashSet<u32>,
    highest_id: u32,
}

/// Remembers which markers were already seen across polls.
#[derive(Default)]
pub struct MarkerWatcher {
    state: Mutex<MarkerState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MarkerWatcher {
    /// Compare one poll against previous ones and return events for markers
    /// that appeared since. Marker ids only grow, so anything at or below the
    /// highest id already seen is old.
    pub fn process(&self, markers: Vec<MapMarker>) -> Vec<MarkerEvent> {
        let mut state = self.state.lock();
        let highest = state.highest_id;
        let mut live = HashSet::with_capacity(markers.len());
        let mut events = Vec::new();

        for marker in markers {
            live.insert(marker.id);
            state.highest_id = state.highest_id.max(marker.id);
            if marker.id > highest && !state.persistent_ids.contains(&marker.id) {
                events.push(MarkerEvent {
                    marker,
                    is_new: true,
                });
            }
        }
        state.persistent_ids = live;
        events
    }

    pub fn persistent_ids(&self) -> HashSet<u32> {
        self.state.lock().persistent_ids.clone()
    }

    pub fn highest_id(&self) -> u32 {
        self.state.lock().highest_id
    }

    /// Forget every marker seen so far.
    pub fn reset(&self) {
        *self.state.lock() = MarkerState::default();
    }

    pub(crate) fn replace_task(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for MarkerWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
