use std::sync::Mutex;
use tracing::info;

/// Moves the user to another application location.
pub trait Navigator: Send + Sync {
    fn navigate(&self, location: &str);
}

/// Navigator for headless hosts: logs every navigation and keeps the history.
#[derive(Default)]
pub struct RecordingNavigator {
    history: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> Vec<String> {
        match self.history.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, location: &str) {
        info!(location, "navigating");
        let mut guard = match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push(location.to_string());
    }
}
