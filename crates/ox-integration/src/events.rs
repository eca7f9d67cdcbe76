//! Emulator notifications
//!
//! Observers (UI, logging, tests) subscribe to an [`EventBus`] and receive
//! every [`EmulatorEvent`] on their own channel.

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::error;

/// Lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmulatorEvent {
    /// A title finished launching
    Launched { title_id: u32, title_name: String },
    /// The running title was terminated
    Terminated,
    /// The main guest thread exited and no restore is pending
    Exited,
    /// Shader storage initialization started (`true`) or finished (`false`)
    ShaderStorageInitialization(bool),
    /// Guest code faulted; the emulator is paused
    GuestCrashed {
        thread_handle: Option<u32>,
        guest_pc: Option<u32>,
    },
}

/// Fan-out of emulator events to any number of subscribers
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<EmulatorEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> Receiver<EmulatorEvent> {
        let (sender, receiver) = unbounded();
        self.subscribers.lock().push(sender);
        receiver
    }

    /// Deliver `event` to every live subscriber, dropping ones whose
    /// receiver has gone away
    pub fn publish(&self, event: EmulatorEvent) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Blocking user-facing message, e.g. a dialog box
pub trait MessageSink: Send + Sync {
    fn show_message(&self, title: &str, message: &str);
}

/// Message sink for headless runs: messages go to the log
pub struct LogMessageSink;

impl MessageSink for LogMessageSink {
    fn show_message(&self, title: &str, message: &str) {
        error!("{}: {}", title, message.replace('\n', " "));
    }
}
