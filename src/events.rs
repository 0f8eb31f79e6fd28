//! Abstract event hooks emitted at the boundary of a source's `run`.
//! Delivery is best-effort and must never block the run engine, so each
//! subscriber is invoked on its own detached task.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

/// Counts of outcomes produced by one source's `run`, attached to
/// `Event::RunStop`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutcomeCounts {
    pub ok: usize,
    pub not_found: usize,
    pub error: usize,
}

impl OutcomeCounts {
    pub fn merge(self, other: OutcomeCounts) -> OutcomeCounts {
        OutcomeCounts {
            ok: self.ok + other.ok,
            not_found: self.not_found + other.not_found,
            error: self.error + other.error,
        }
    }
}

/// An event emitted by the run engine.
#[derive(Debug, Clone)]
pub enum Event {
    RunStart {
        source_name: Cow<'static, str>,
    },
    RunStop {
        source_name: Cow<'static, str>,
        duration: Duration,
        outcome_counts: OutcomeCounts,
    },
    RunException {
        source_name: Cow<'static, str>,
        cause: String,
    },
}

pub type Subscriber = Arc<dyn Fn(Event) + Send + Sync>;

/// Holds the subscribers registered at loader construction and fans an
/// event out to all of them without blocking the caller.
#[derive(Clone, Default)]
pub struct EventSink {
    subscribers: Vec<Subscriber>,
}

impl EventSink {
    pub fn new(subscribers: Vec<Subscriber>) -> Self {
        EventSink { subscribers }
    }

    /// Deliver `event` to every subscriber on its own detached task. Never
    /// awaits the subscriber, so a slow or panicking subscriber can't stall
    /// `run`.
    pub fn emit(&self, event: Event) {
        if self.subscribers.is_empty() {
            return;
        }

        for subscriber in &self.subscribers {
            let subscriber = subscriber.clone();
            let event = event.clone();
            tokio::spawn(async move {
                subscriber(event);
            });
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
