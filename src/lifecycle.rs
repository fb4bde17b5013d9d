//! Explicit stop signal shared by the session loop and long-running drains.

use tokio::sync::watch;

/// Owner side: flips the token once
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

/// Checked at each suspension point of a cancellable task
#[derive(Clone)]
pub struct StopToken {
    rx: watch::Receiver<bool>,
}

pub fn stop_pair() -> (StopHandle, StopToken) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopToken { rx })
}

impl StopHandle {
    /// Tokens subscribed later still observe the stop
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn token(&self) -> StopToken {
        StopToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl StopToken {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once stop is requested, or once the handle is gone
    pub async fn stopped(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}
