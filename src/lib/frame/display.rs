use std::sync::Mutex;

use crate::source::SourceId;

use super::Frame;

#[derive(Debug, Default)]
struct DisplayState {
    active: Option<SourceId>,
    frame: Option<Frame>,
}

/// The "currently displayed" frame. Writers copy in and readers copy out,
/// the lock is never held across anything slower than a clone.
#[derive(Debug, Default)]
pub struct DisplayBuffer {
    state: Mutex<DisplayState>,
}

impl DisplayBuffer {
    pub fn new(active: Option<SourceId>) -> Self {
        Self {
            state: Mutex::new(DisplayState {
                active,
                frame: None,
            }),
        }
    }

    pub fn is_active(&self, source_id: &str) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        state.active.as_deref() == Some(source_id)
    }

    pub fn set_active(&self, source_id: Option<SourceId>) {
        if let Ok(mut state) = self.state.lock() {
            if state.active != source_id {
                state.frame = None;
            }
            state.active = source_id;
        }
    }

    /// Stores the frame if it belongs to the active source. Returns whether it was kept.
    pub fn offer(&self, frame: &Frame) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.active.as_deref() != Some(frame.source_id.as_str()) {
            return false;
        }
        state.frame = Some(frame.clone());
        true
    }

    pub fn latest(&self) -> Option<Frame> {
        self.state.lock().ok()?.frame.clone()
    }
}
