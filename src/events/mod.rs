//! In-process domain event bus.
//!
//! Single writer, synchronous fan-out. Handlers subscribe through the
//! builder (never via globals), either for one event kind or for all
//! events. Publication is fire-and-forget: a handler that fails or
//! panics is logged and skipped, and never fails the operation that
//! published the event. Handlers must not block; anything slow hands off
//! to its own task internally.

use crate::domain::{Intent, InterventionLevel, InterventionType, Language, RunStatus, SessionStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

// ── Events ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    SessionStarted {
        session_id: Uuid,
        track: String,
    },
    SessionEnded {
        session_id: Uuid,
        status: SessionStatus,
    },
    RunCompleted {
        session_id: Uuid,
        run_id: Uuid,
        language: Language,
        status: RunStatus,
        tests_passed: u32,
        tests_failed: u32,
        all_tests_passed: bool,
        build_error_summary: Option<String>,
        /// Seconds from session creation to this run finishing.
        session_age_seconds: u64,
    },
    InterventionDelivered {
        session_id: Uuid,
        intervention_id: Uuid,
        intent: Intent,
        level: InterventionLevel,
        kind: InterventionType,
    },
    SkillUpdated {
        topic: String,
        level: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionStarted,
    SessionEnded,
    RunCompleted,
    InterventionDelivered,
    SkillUpdated,
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::SessionStarted { .. } => EventKind::SessionStarted,
            Self::SessionEnded { .. } => EventKind::SessionEnded,
            Self::RunCompleted { .. } => EventKind::RunCompleted,
            Self::InterventionDelivered { .. } => EventKind::InterventionDelivered,
            Self::SkillUpdated { .. } => EventKind::SkillUpdated,
        }
    }
}

// ── Handlers ─────────────────────────────────────────────────────

pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;
    fn handle(&self, event: &DomainEvent);
}

/// Closure adapter for simple subscribers.
pub struct FnHandler<F: Fn(&DomainEvent) + Send + Sync> {
    name: String,
    func: F,
}

impl<F: Fn(&DomainEvent) + Send + Sync> FnHandler<F> {
    pub fn new(name: &str, func: F) -> Self {
        Self {
            name: name.to_string(),
            func,
        }
    }
}

impl<F: Fn(&DomainEvent) + Send + Sync> EventHandler for FnHandler<F> {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, event: &DomainEvent) {
        (self.func)(event);
    }
}

// ── Bus ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct EventBusBuilder {
    typed: HashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
    all: Vec<Arc<dyn EventHandler>>,
}

impl EventBusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler to one event kind.
    pub fn on(mut self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Self {
        self.typed.entry(kind).or_default().push(handler);
        self
    }

    /// Subscribe a handler to every event.
    pub fn on_all(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.all.push(handler);
        self
    }

    pub fn build(self) -> EventBus {
        EventBus {
            typed: self.typed,
            all: self.all,
        }
    }
}

/// Immutable after build; shared by reference.
pub struct EventBus {
    typed: HashMap<EventKind, Vec<Arc<dyn EventHandler>>>,
    all: Vec<Arc<dyn EventHandler>>,
}

impl EventBus {
    /// Deliver `event` to every subscribed handler, in registration order,
    /// typed subscribers first. Handler failures are contained.
    pub fn publish(&self, event: &DomainEvent) {
        let typed = self.typed.get(&event.kind()).map(Vec::as_slice).unwrap_or(&[]);
        for handler in typed.iter().chain(self.all.iter()) {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler.handle(event)
            }));
            if result.is_err() {
                tracing::warn!(
                    handler = handler.name(),
                    event = ?event.kind(),
                    "event handler panicked; continuing"
                );
            }
        }
    }

    pub fn handler_count(&self) -> usize {
        self.typed.values().map(Vec::len).sum::<usize>() + self.all.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn session_event() -> DomainEvent {
        DomainEvent::SessionStarted {
            session_id: Uuid::new_v4(),
            track: "balanced".into(),
        }
    }

    fn skill_event() -> DomainEvent {
        DomainEvent::SkillUpdated {
            topic: "ownership".into(),
            level: 0.4,
        }
    }

    #[test]
    fn typed_handlers_only_see_their_kind() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let bus = EventBusBuilder::new()
            .on(
                EventKind::SessionStarted,
                Arc::new(FnHandler::new("counter", move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .build();

        bus.publish(&session_event());
        bus.publish(&skill_event());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wildcard_handlers_see_everything() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let bus = EventBusBuilder::new()
            .on_all(Arc::new(FnHandler::new("audit", move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })))
            .build();

        bus.publish(&session_event());
        bus.publish(&skill_event());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_handler_does_not_stop_fanout() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let bus = EventBusBuilder::new()
            .on(
                EventKind::SessionStarted,
                Arc::new(FnHandler::new("broken", |_| panic!("handler bug"))),
            )
            .on(
                EventKind::SessionStarted,
                Arc::new(FnHandler::new("healthy", move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .build();

        bus.publish(&session_event());
        assert_eq!(count.load(Ordering::SeqCst), 1, "later handlers still run");
    }

    #[test]
    fn publish_with_no_handlers_is_fine() {
        let bus = EventBusBuilder::new().build();
        bus.publish(&session_event());
        assert_eq!(bus.handler_count(), 0);
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(session_event()).unwrap();
        assert_eq!(json["event"], "session_started");
        assert_eq!(json["track"], "balanced");
    }
}
