//! Named breakpoints for deterministic fault injection in tests.
//!
//! Production code threads a [`PauseClient`] through and calls
//! `wait(label)` at interesting points. Outside of test builds the client
//! is a unit struct and every wait is a no-op. In tests, a
//! [`PauseController`] can block the code at a label, inject an error, and
//! release it.

/// What a released breakpoint tells the paused code to do.
#[derive(Default)]
pub enum Fault {
    #[default]
    Noop,
    Error(anyhow::Error),
}

#[cfg(any(test, feature = "testing"))]
mod test_pause {
    use std::{
        collections::BTreeMap,
        sync::Arc,
    };

    use parking_lot::Mutex;
    use tokio::sync::{
        mpsc,
        oneshot,
    };

    use super::Fault;

    type Release = oneshot::Sender<Fault>;

    #[derive(Clone, Default)]
    pub struct PauseClient {
        channels: Arc<Mutex<BTreeMap<&'static str, mpsc::UnboundedSender<Release>>>>,
    }

    impl PauseClient {
        pub fn new() -> Self {
            Self::default()
        }

        /// Block on the named breakpoint until the controller releases it.
        /// Unregistered labels return immediately.
        pub async fn wait(&self, label: &'static str) -> Fault {
            let Some(blocked_tx) = self.channels.lock().get(label).cloned() else {
                return Fault::Noop;
            };
            let (release_tx, release_rx) = oneshot::channel();
            if blocked_tx.send(release_tx).is_err() {
                tracing::debug!("Pause controller for {label:?} has gone away");
                return Fault::Noop;
            }
            release_rx.await.unwrap_or_default()
        }
    }

    pub struct PauseController {
        channels: BTreeMap<&'static str, mpsc::UnboundedReceiver<Release>>,
    }

    impl PauseController {
        pub fn new(labels: impl IntoIterator<Item = &'static str>) -> (Self, PauseClient) {
            let client = PauseClient::new();
            let mut channels = BTreeMap::new();
            for label in labels {
                let (tx, rx) = mpsc::unbounded_channel();
                client.channels.lock().insert(label, tx);
                channels.insert(label, rx);
            }
            (Self { channels }, client)
        }

        /// Wait for the tested code to hit `label`, returning a guard while
        /// it is blocked. Returns `None` if the code has exited.
        pub async fn wait_for_blocked(&mut self, label: &'static str) -> Option<PauseGuard> {
            let rx = self.channels.get_mut(label)?;
            let release = rx.recv().await?;
            Some(PauseGuard {
                release: Some(release),
                fault: Fault::Noop,
            })
        }
    }

    pub struct PauseGuard {
        release: Option<Release>,
        fault: Fault,
    }

    impl PauseGuard {
        /// Make the paused `wait` call surface `error` when released.
        pub fn inject_error(&mut self, error: anyhow::Error) {
            self.fault = Fault::Error(error);
        }

        /// Release the paused code.
        pub fn unpause(&mut self) {
            if let Some(release) = self.release.take() {
                let fault = std::mem::take(&mut self.fault);
                let _ = release.send(fault);
            }
        }
    }

    impl Drop for PauseGuard {
        fn drop(&mut self) {
            self.unpause();
        }
    }
}

#[cfg(any(test, feature = "testing"))]
pub use self::test_pause::{
    PauseClient,
    PauseController,
    PauseGuard,
};

#[cfg(not(any(test, feature = "testing")))]
mod prod_pause {
    use super::Fault;

    #[derive(Clone, Default)]
    pub struct PauseClient;

    impl PauseClient {
        pub fn new() -> Self {
            Self
        }

        pub async fn wait(&self, _label: &'static str) -> Fault {
            Fault::Noop
        }
    }
}

#[cfg(not(any(test, feature = "testing")))]
pub use self::prod_pause::PauseClient;
