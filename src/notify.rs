use tracing::warn;

/// User-facing notification sink. The desktop toast implementation lives
/// outside this crate; the daemon only depends on the contract.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str);
}

/// Fallback notifier that surfaces notifications as warn-level log lines.
#[derive(Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, message: &str) {
        warn!(title, message, "user notification");
    }
}

#[cfg(test)]
pub mod testing {
    use super::Notifier;
    use std::sync::Mutex;

    /// Records notifications for assertions.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub messages: Mutex<Vec<(String, String)>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, title: &str, message: &str) {
            self.messages
                .lock()
                .unwrap()
                .push((title.to_string(), message.to_string()));
        }
    }
}
