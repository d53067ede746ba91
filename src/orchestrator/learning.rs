//! Learning-profile maintenance, driven by domain events.
//!
//! The updater subscribes to run and intervention events and folds them
//! into the cross-session profile. Skill changes are announced back on
//! the bus as `SkillUpdated`; the bus reference is bound once after the
//! bus is built (handlers are registered before the bus exists).

use crate::events::{DomainEvent, EventBus, EventHandler};
use crate::store::ProfileStore;
use std::sync::{Arc, OnceLock};

pub struct ProfileUpdater {
    profiles: Arc<ProfileStore>,
    bus: OnceLock<Arc<EventBus>>,
}

impl ProfileUpdater {
    pub fn new(profiles: Arc<ProfileStore>) -> Arc<Self> {
        Arc::new(Self {
            profiles,
            bus: OnceLock::new(),
        })
    }

    /// Bind the bus for `SkillUpdated` announcements. Called once during
    /// daemon wiring, after the bus is built.
    pub fn bind_bus(&self, bus: Arc<EventBus>) {
        let _ = self.bus.set(bus);
    }
}

impl EventHandler for ProfileUpdater {
    fn name(&self) -> &str {
        "profile-updater"
    }

    fn handle(&self, event: &DomainEvent) {
        match event {
            DomainEvent::RunCompleted {
                language,
                all_tests_passed,
                build_error_summary,
                session_age_seconds,
                ..
            } => {
                let mut profile = match self.profiles.load() {
                    Ok(profile) => profile,
                    Err(e) => {
                        tracing::warn!("profile load failed: {e}");
                        return;
                    }
                };

                let topic = language.label();
                profile.record_run(topic, *all_tests_passed, chrono::Utc::now());
                if let Some(summary) = build_error_summary {
                    profile.record_common_error(summary);
                }
                if *all_tests_passed {
                    profile.record_time_to_green(*session_age_seconds as f64);
                }
                let skill = profile.topic_skills.get(topic).map(|s| s.level);

                if let Err(e) = self.profiles.save(&profile) {
                    tracing::warn!("profile save failed: {e}");
                    return;
                }

                if let (Some(bus), Some(level)) = (self.bus.get(), skill) {
                    bus.publish(&DomainEvent::SkillUpdated {
                        topic: topic.to_string(),
                        level,
                    });
                }
            }
            DomainEvent::InterventionDelivered { .. } => {
                match self.profiles.load() {
                    Ok(mut profile) => {
                        profile.record_hint();
                        if let Err(e) = self.profiles.save(&profile) {
                            tracing::warn!("profile save failed: {e}");
                        }
                    }
                    Err(e) => tracing::warn!("profile load failed: {e}"),
                }
            }
            _ => {}
        }
    }
}
