//! Collector events and the per-collector broadcast bus.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use mirrorprobe_core::ResultEnvelope;

/// Buffered events per channel before slow subscribers start lagging.
pub const EVENT_CAPACITY: usize = 1024;

/// Something that happened inside the collector.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A recurring job was created for `probe` against `registry`.
    Scheduled {
        probe: String,
        registry: String,
        at: i64,
    },
    /// A probe tick completed.
    Ran(ResultEnvelope),
    /// A probe tick failed; no envelope was built.
    ProbeError {
        probe: String,
        registry: String,
        message: String,
    },
    /// Feed refresh or cache failure.
    Error {
        message: String,
    },
}

impl Event {
    /// The probe this event belongs to, if any.
    pub fn probe(&self) -> Option<&str> {
        match self {
            Event::Scheduled { probe, .. } | Event::ProbeError { probe, .. } => Some(probe),
            Event::Ran(envelope) => Some(&envelope.probe),
            Event::Error { .. } => None,
        }
    }
}

/// One global channel plus one channel per probe name.
///
/// Closing drops every sender, so subscribers see `RecvError::Closed` once
/// they have drained what was already sent.
#[derive(Debug)]
pub struct EventBus {
    global: Mutex<Option<broadcast::Sender<Event>>>,
    scoped: Mutex<HashMap<String, broadcast::Sender<Event>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            global: Mutex::new(Some(tx)),
            scoped: Mutex::new(HashMap::new()),
        }
    }

    /// Receive every event.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        match lock(&self.global).as_ref() {
            Some(tx) => tx.subscribe(),
            None => closed(),
        }
    }

    /// Open the channel for `probe` if it does not exist yet.
    pub fn add_scope(&self, probe: &str) {
        if self.is_closed() {
            return;
        }
        lock(&self.scoped)
            .entry(probe.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CAPACITY).0);
    }

    /// Receive only the events of `probe`.
    pub fn subscribe_probe(&self, probe: &str) -> broadcast::Receiver<Event> {
        self.add_scope(probe);
        match lock(&self.scoped).get(probe) {
            Some(tx) => tx.subscribe(),
            None => closed(),
        }
    }

    /// Send to the global channel and, for probe events, the probe's
    /// channel. Events without subscribers are dropped.
    pub fn emit(&self, event: Event) {
        if let Some(probe) = event.probe() {
            if let Some(tx) = lock(&self.scoped).get(probe) {
                let _ = tx.send(event.clone());
            }
        }
        if let Some(tx) = lock(&self.global).as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn close(&self) {
        lock(&self.global).take();
        lock(&self.scoped).clear();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.global).is_none()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn closed() -> broadcast::Receiver<Event> {
    broadcast::channel(1).1
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorprobe_core::{Describe, ResultPayload};
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    fn ran(probe: &str) -> Event {
        let payload = ResultPayload::Ping(Describe::ZERO);
        Event::Ran(ResultEnvelope::new(probe, "npmjs", payload, 0, 1))
    }

    #[test]
    fn scoped_subscribers_only_see_their_probe() {
        let bus = EventBus::new();
        let mut all = bus.subscribe();
        let mut ping = bus.subscribe_probe("ping");

        bus.emit(ran("ping"));
        bus.emit(ran("delta"));
        bus.emit(Event::Error {
            message: "feed down".to_string(),
        });

        assert_eq!(ping.try_recv().unwrap().probe(), Some("ping"));
        assert_eq!(ping.try_recv(), Err(TryRecvError::Empty));

        let mut seen = 0;
        while all.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 3);
    }

    #[tokio::test]
    async fn close_ends_every_subscription() {
        let bus = EventBus::new();
        let mut all = bus.subscribe();
        let mut ping = bus.subscribe_probe("ping");
        bus.emit(ran("ping"));
        bus.close();

        assert!(matches!(all.recv().await, Ok(Event::Ran(_))));
        assert_eq!(all.recv().await, Err(RecvError::Closed));
        assert!(ping.recv().await.is_ok());
        assert_eq!(ping.recv().await, Err(RecvError::Closed));

        assert!(bus.is_closed());
        assert_eq!(bus.subscribe().recv().await, Err(RecvError::Closed));
        let mut late = bus.subscribe_probe("ping");
        assert_eq!(late.recv().await, Err(RecvError::Closed));
    }
}
