//! Ephemeral store wrapper for failure injection and latency.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{Command, EphemeralStore, Error, Reply, Result};

use crate::datastore::FailureMode;

/// Wraps an ephemeral store and fails commands by name on demand.
///
/// An atomic batch fails as a whole when any of its commands is armed.
#[derive(Clone)]
pub struct FailingEphemeralStore {
    inner: Arc<dyn EphemeralStore>,
    failures: Arc<Mutex<HashMap<&'static str, FailureMode>>>,
    latency: Option<Duration>,
}

impl FailingEphemeralStore {
    /// Wraps `inner` with no failures armed.
    pub fn new(inner: impl EphemeralStore) -> Self {
        Self {
            inner: Arc::new(inner),
            failures: Arc::new(Mutex::new(HashMap::new())),
            latency: None,
        }
    }

    /// Delays every call by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fails the next command named `command` (for example `"ZPOPMIN"`).
    pub fn fail_once(&self, command: &'static str) {
        self.failures
            .lock()
            .expect("lock")
            .insert(command, FailureMode::Once);
    }

    /// Fails every command named `command` until [`Self::clear`] is called.
    pub fn fail_always(&self, command: &'static str) {
        self.failures
            .lock()
            .expect("lock")
            .insert(command, FailureMode::Always);
    }

    /// Lets `successes` commands named `command` through, then fails the next one.
    pub fn fail_after(&self, command: &'static str, successes: usize) {
        self.failures
            .lock()
            .expect("lock")
            .insert(command, FailureMode::After(successes));
    }

    /// Disarms every injected failure.
    pub fn clear(&self) {
        self.failures.lock().expect("lock").clear();
    }

    fn check<'a>(&self, names: impl IntoIterator<Item = &'a Command>) -> Result<()> {
        let mut failures = self.failures.lock().expect("lock");
        for command in names {
            let name = command.name();
            match failures.get(name).copied() {
                Some(FailureMode::Once | FailureMode::After(0)) => {
                    failures.remove(name);
                    return Err(Error::storage(format!("injected failure for {name}")));
                }
                Some(FailureMode::After(remaining)) => {
                    failures.insert(name, FailureMode::After(remaining - 1));
                }
                Some(FailureMode::Always) => {
                    return Err(Error::storage(format!("injected failure for {name}")));
                }
                None => {}
            }
        }
        Ok(())
    }

    async fn maybe_delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl EphemeralStore for FailingEphemeralStore {
    async fn execute(&self, command: Command) -> Result<Reply> {
        self.maybe_delay().await;
        self.check(std::iter::once(&command))?;
        self.inner.execute(command).await
    }

    async fn run_atomic(&self, commands: Vec<Command>) -> Result<Vec<Reply>> {
        self.maybe_delay().await;
        self.check(&commands)?;
        self.inner.run_atomic(commands).await
    }
}
