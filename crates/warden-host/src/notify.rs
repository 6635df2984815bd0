//! Fire-and-forget seam to the chat subsystem.

use warden_types::NotifyCategory;

/// The real implementation lives in the management service; the host
/// only pushes status strings through this seam and never waits on
/// delivery.
pub trait ChatNotifier: Send + Sync {
    fn notify(&self, text: &str, category: NotifyCategory);
}

/// Default sink: structured log lines, picked up by whatever broadcast
/// relay is attached to the service.
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

impl ChatNotifier for TracingNotifier {
    fn notify(&self, text: &str, category: NotifyCategory) {
        tracing::info!(target: "warden::chat", ?category, "{text}");
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Captures notifications for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        pub seen: Mutex<Vec<(String, NotifyCategory)>>,
    }

    impl ChatNotifier for RecordingNotifier {
        fn notify(&self, text: &str, category: NotifyCategory) {
            self.seen.lock().unwrap().push((text.to_string(), category));
        }
    }
}
