use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Shared shutdown signal. Async tasks wait on `recv`, the host thread checks `is_triggered`
/// between pump slices.
pub struct Shutdown {
    shutdown: bool,
    triggered: Arc<AtomicBool>,
    sender: broadcast::Sender<()>,
    receiver: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, receiver) = broadcast::channel(1);
        Self {
            shutdown: false,
            triggered: Arc::new(AtomicBool::new(false)),
            sender,
            receiver,
        }
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::Relaxed);
        let _ = self.sender.send(());
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Relaxed)
    }

    pub async fn recv(&mut self) {
        // A clone made after the trigger never sees the broadcast, so check the flag too.
        if self.shutdown || self.is_triggered() {
            self.shutdown = true;
            return;
        }

        let _ = self.receiver.recv().await;
        self.shutdown = true;
    }
}

impl Clone for Shutdown {
    fn clone(&self) -> Self {
        let sender = self.sender.clone();
        let receiver = self.sender.subscribe();
        Self {
            shutdown: self.shutdown,
            triggered: self.triggered.clone(),
            sender,
            receiver,
        }
    }
}
