//! The pairing orchestrator: validate → select → compose → invoke →
//! record → publish.
//!
//! This is the only component that sees the whole pipeline. It owns no
//! policy of its own: level decisions live in the selector, prompt rules
//! in the composer, resilience in the provider chain, and invariants in
//! the session aggregate. Events are published only after the mutation
//! they describe is durable.

pub mod learning;

use crate::catalog::{ExerciseCatalog, SpecSource};
use crate::composer::{Composer, CompositionInput};
use crate::config::LlmSettings;
use crate::domain::{
    Exercise, Intent, Intervention, InterventionLevel, LearningPolicy, LearningProfile,
    Language, ProductSpec, Recipe, Run, RunOutput, RunStatus, Session, SessionMode,
    MIN_JUSTIFICATION_LEN,
};
use crate::error::PairingError;
use crate::events::{DomainEvent, EventBus};
use crate::providers::{ChatRequest, ProviderError, ProviderRegistry, StreamChunk};
use crate::sandbox::{Sandbox, SandboxError};
use crate::selector::{SelectionContext, Selector};
use crate::session::SessionManager;
use crate::store::{DocumentStore, ProfileStore};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

// ── Requests ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CreateSessionRequest {
    pub exercise_id: Option<String>,
    pub spec_path: Option<String>,
    pub track: Option<String>,
    /// Explicit mode; inferred from the bindings when absent.
    pub mode: Option<SessionMode>,
}

#[derive(Debug, Clone)]
pub struct PairingArgs {
    pub session_id: Uuid,
    pub intent: Intent,
    /// Replacement working set, when the plugin sends fresh code.
    pub code: Option<BTreeMap<String, String>>,
    /// When both are present alongside `code`, a run is executed and its
    /// output feeds level selection.
    pub language: Option<Language>,
    pub recipe: Option<Recipe>,
    pub focus_criterion: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EscalationArgs {
    pub session_id: Uuid,
    pub level: u8,
    pub justification: String,
    pub code: Option<BTreeMap<String, String>>,
}

/// Streamed pairing reply fragment, enriched with pipeline identity.
#[derive(Debug, Clone, PartialEq)]
pub enum PairingChunk {
    Metadata {
        level: InterventionLevel,
        kind: crate::domain::InterventionType,
    },
    Content {
        content: String,
    },
    Error {
        error: String,
    },
    Done {
        intervention_id: Uuid,
    },
}

// ── Orchestrator ─────────────────────────────────────────────────

pub struct Orchestrator {
    pub sessions: Arc<SessionManager>,
    pub sandbox: Arc<Sandbox>,
    pub providers: Arc<ProviderRegistry>,
    pub profiles: Arc<ProfileStore>,
    pub documents: Arc<DocumentStore>,
    pub exercises: Arc<dyn ExerciseCatalog>,
    pub specs: Arc<dyn SpecSource>,
    pub bus: Arc<EventBus>,
    pub selector: Selector,
    pub composer: Composer,
    pub llm: LlmSettings,
    pub default_track: String,
}

/// Everything resolved for one selection + composition.
struct ResolvedContext {
    session: Session,
    exercise: Option<Exercise>,
    spec: Option<ProductSpec>,
    profile: Option<LearningProfile>,
    run_output: Option<RunOutput>,
    run_id: Option<Uuid>,
}

impl Orchestrator {
    // ── Session lifecycle ────────────────────────────────────────

    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<Session, PairingError> {
        if let Some(ref id) = request.exercise_id {
            let found = self
                .exercises
                .load(id)
                .map_err(|e| PairingError::Internal(e.to_string()))?;
            if found.is_none() {
                return Err(PairingError::ExerciseNotFound(id.clone()));
            }
        }
        if let Some(ref path) = request.spec_path {
            let found = self
                .specs
                .load(path)
                .map_err(|e| PairingError::Internal(e.to_string()))?;
            let Some(spec) = found else {
                return Err(PairingError::SpecNotFound(path.clone()));
            };
            // Archive the bound spec content-addressed; binding the same
            // spec twice is a no-op.
            if let Ok(bytes) = serde_json::to_vec(&spec) {
                if let Err(e) = self.documents.put(&bytes) {
                    tracing::warn!("failed to archive spec document: {e}");
                }
            }
        }

        let mode = request.mode.unwrap_or(match (&request.exercise_id, &request.spec_path) {
            (Some(_), _) => SessionMode::Training,
            (None, Some(_)) => SessionMode::FeatureGuidance,
            (None, None) => SessionMode::Greenfield,
        });
        let track = request.track.as_deref().unwrap_or(&self.default_track);
        let policy = LearningPolicy::from_track(track)
            .ok_or_else(|| PairingError::InvalidRequest(format!("unknown track: {track}")))?;

        let session = self.sessions.create(
            mode,
            policy,
            request.exercise_id.clone(),
            request.spec_path.clone(),
        )?;

        self.bus.publish(&DomainEvent::SessionStarted {
            session_id: session.id,
            track: session.policy.track.clone(),
        });
        Ok(session)
    }

    pub fn get_session(&self, id: Uuid) -> Result<Session, PairingError> {
        self.sessions.get(id)
    }

    pub async fn terminate_session(
        &self,
        id: Uuid,
        completed: bool,
    ) -> Result<Session, PairingError> {
        let session = self.sessions.terminate(id, completed).await?;
        self.bus.publish(&DomainEvent::SessionEnded {
            session_id: session.id,
            status: session.status,
        });
        Ok(session)
    }

    // ── Code runs ────────────────────────────────────────────────

    /// Execute the session's code and record the run.
    pub async fn run_code(
        &self,
        session_id: Uuid,
        code: BTreeMap<String, String>,
        language: Language,
        recipe: Recipe,
    ) -> Result<Run, PairingError> {
        let session = self.sessions.get(session_id)?;
        if !session.is_active() {
            return Err(PairingError::SessionNotActive);
        }

        let started_at = Utc::now();
        let report = self
            .sandbox
            .execute(language, &code, &recipe)
            .await
            .map_err(map_sandbox_error)?;

        let mut run = Run::new(session_id, language, code.clone(), recipe);
        run.status = report.status;
        run.started_at = Some(started_at);
        run.finished_at = Some(Utc::now());
        run.output = Some(report.output.clone());

        let all_green = report.output.all_tests_passed();
        self.sessions
            .mutate(session_id, |s| {
                s.update_code(code.clone(), Utc::now())?;
                s.record_run(all_green, Utc::now())?;
                Ok(())
            })
            .await?;
        self.sessions
            .store()
            .save_run(&run)
            .map_err(|e| PairingError::Internal(e.to_string()))?;

        self.bus.publish(&DomainEvent::RunCompleted {
            session_id,
            run_id: run.id,
            language,
            status: run.status,
            tests_passed: report.output.tests_passed,
            tests_failed: report.output.tests_failed,
            all_tests_passed: all_green,
            build_error_summary: report
                .output
                .build_errors
                .first()
                .map(|d| d.message.clone()),
            session_age_seconds: (Utc::now() - session.created_at).num_seconds().max(0) as u64,
        });

        Ok(run)
    }

    // ── Pairing (unary) ──────────────────────────────────────────

    pub async fn pair(&self, args: PairingArgs) -> Result<Intervention, PairingError> {
        if args.intent == Intent::Escalate {
            return Err(PairingError::InvalidEscalation {
                reason: "escalation must go through the escalate operation".into(),
            });
        }

        let ctx = self.resolve_context(&args).await?;
        let selection = self.selector.select(
            args.intent,
            &selection_view(&ctx, args.focus_criterion.as_deref()),
            &ctx.session.policy,
        );

        self.check_cooldown(&ctx.session, selection.level)?;

        let prompts = self
            .composer
            .build(&CompositionInput {
                intent: args.intent,
                selection,
                exercise: ctx.exercise.as_ref(),
                code: &ctx.session.code,
                run_output: ctx.run_output.as_ref(),
                spec: ctx.spec.as_ref(),
                focus_criterion: args.focus_criterion.as_deref(),
                justification: None,
            })
            .map_err(|e| PairingError::Internal(e.to_string()))?;

        let content = self.invoke(&prompts.system, &prompts.user).await?;
        self.record_intervention(
            &ctx,
            args.intent,
            selection.level,
            selection.kind,
            content,
        )
        .await
    }

    // ── Pairing (streaming) ──────────────────────────────────────

    /// Streaming variant: identical through composition; chunks are
    /// forwarded as produced. The intervention is recorded only when the
    /// provider stream terminates with `done`; consumer cancellation
    /// (dropping the receiver) aborts the provider call and records
    /// nothing.
    pub async fn pair_stream(
        self: Arc<Self>,
        args: PairingArgs,
    ) -> Result<tokio::sync::mpsc::Receiver<PairingChunk>, PairingError> {
        if args.intent == Intent::Escalate {
            return Err(PairingError::InvalidEscalation {
                reason: "escalation must go through the escalate operation".into(),
            });
        }

        let ctx = self.resolve_context(&args).await?;
        let selection = self.selector.select(
            args.intent,
            &selection_view(&ctx, args.focus_criterion.as_deref()),
            &ctx.session.policy,
        );
        self.check_cooldown(&ctx.session, selection.level)?;

        let prompts = self
            .composer
            .build(&CompositionInput {
                intent: args.intent,
                selection,
                exercise: ctx.exercise.as_ref(),
                code: &ctx.session.code,
                run_output: ctx.run_output.as_ref(),
                spec: ctx.spec.as_ref(),
                focus_criterion: args.focus_criterion.as_deref(),
                justification: None,
            })
            .map_err(|e| PairingError::Internal(e.to_string()))?;

        let provider = self.default_provider()?;
        let request = self.chat_request(&prompts.system, &prompts.user);
        let mut upstream = provider
            .invoke_stream(&request)
            .await
            .map_err(map_provider_error)?;

        let (tx, rx) = tokio::sync::mpsc::channel::<PairingChunk>(16);
        let intent = args.intent;
        let this = Arc::clone(&self);
        tokio::spawn(async move {
            use futures_util::StreamExt;

            if tx
                .send(PairingChunk::Metadata {
                    level: selection.level,
                    kind: selection.kind,
                })
                .await
                .is_err()
            {
                return;
            }

            let mut content = String::new();
            while let Some(chunk) = upstream.next().await {
                match chunk {
                    StreamChunk::Metadata { .. } => {}
                    StreamChunk::Content { content: piece } => {
                        content.push_str(&piece);
                        if tx
                            .send(PairingChunk::Content { content: piece })
                            .await
                            .is_err()
                        {
                            // Consumer cancelled: drop the provider stream,
                            // record nothing.
                            return;
                        }
                    }
                    StreamChunk::Error { error } => {
                        let _ = tx.send(PairingChunk::Error { error }).await;
                        return;
                    }
                    StreamChunk::Done => {
                        match this
                            .record_intervention(
                                &ctx,
                                intent,
                                selection.level,
                                selection.kind,
                                std::mem::take(&mut content),
                            )
                            .await
                        {
                            Ok(intervention) => {
                                let _ = tx
                                    .send(PairingChunk::Done {
                                        intervention_id: intervention.id,
                                    })
                                    .await;
                            }
                            Err(e) => {
                                let _ = tx
                                    .send(PairingChunk::Error {
                                        error: e.to_string(),
                                    })
                                    .await;
                            }
                        }
                        return;
                    }
                }
            }
            // Upstream ended without a terminal marker: surface an error,
            // record nothing.
            let _ = tx
                .send(PairingChunk::Error {
                    error: "provider stream ended unexpectedly".into(),
                })
                .await;
        });

        Ok(rx)
    }

    // ── Escalation ───────────────────────────────────────────────

    pub async fn escalate(&self, args: EscalationArgs) -> Result<Intervention, PairingError> {
        let level = match args.level {
            4 => InterventionLevel::PartialSolution,
            5 => InterventionLevel::FullSolution,
            other => {
                return Err(PairingError::InvalidEscalation {
                    reason: format!("escalation level must be 4 or 5, got {other}"),
                })
            }
        };
        let justification = args.justification.trim().to_string();
        if justification.chars().count() < MIN_JUSTIFICATION_LEN {
            return Err(PairingError::InvalidEscalation {
                reason: format!(
                    "justification must be at least {MIN_JUSTIFICATION_LEN} characters"
                ),
            });
        }

        let pairing = PairingArgs {
            session_id: args.session_id,
            intent: Intent::Escalate,
            code: args.code,
            language: None,
            recipe: None,
            focus_criterion: None,
        };
        let ctx = self.resolve_context(&pairing).await?;
        let selection = self.selector.select_escalation(level);
        self.check_cooldown(&ctx.session, selection.level)?;

        let prompts = self
            .composer
            .build(&CompositionInput {
                intent: Intent::Escalate,
                selection,
                exercise: ctx.exercise.as_ref(),
                code: &ctx.session.code,
                run_output: ctx.run_output.as_ref(),
                spec: ctx.spec.as_ref(),
                focus_criterion: None,
                justification: Some(&justification),
            })
            .map_err(|e| PairingError::Internal(e.to_string()))?;

        let content = self.invoke(&prompts.system, &prompts.user).await?;
        self.record_intervention(&ctx, Intent::Escalate, level, selection.kind, content)
            .await
    }

    // ── Internals ────────────────────────────────────────────────

    async fn resolve_context(&self, args: &PairingArgs) -> Result<ResolvedContext, PairingError> {
        let session = self.sessions.get(args.session_id)?;
        if !session.is_active() {
            return Err(PairingError::SessionNotActive);
        }

        // Fresh code plus a recipe triggers a run whose output feeds
        // selection; fresh code alone just replaces the working set.
        let (run_output, run_id, session) = match (&args.code, args.language, &args.recipe) {
            (Some(code), Some(language), Some(recipe)) => {
                let run = self
                    .run_code(args.session_id, code.clone(), language, *recipe)
                    .await?;
                let output = run.output.clone();
                (output, Some(run.id), self.sessions.get(args.session_id)?)
            }
            (Some(code), _, _) => {
                let code = code.clone();
                self.sessions
                    .mutate(args.session_id, move |s| {
                        s.update_code(code, Utc::now()).map_err(PairingError::from)
                    })
                    .await?;
                let session = self.sessions.get(args.session_id)?;
                let output = self.latest_run_output(args.session_id)?;
                (output, None, session)
            }
            _ => {
                let output = self.latest_run_output(args.session_id)?;
                (output, None, session)
            }
        };

        let exercise = match &session.exercise_id {
            Some(id) => Some(
                self.exercises
                    .load(id)
                    .map_err(|e| PairingError::Internal(e.to_string()))?
                    .ok_or_else(|| PairingError::ExerciseNotFound(id.clone()))?,
            ),
            None => None,
        };
        let spec = match &session.spec_path {
            Some(path) => Some(
                self.specs
                    .load(path)
                    .map_err(|e| PairingError::Internal(e.to_string()))?
                    .ok_or_else(|| PairingError::SpecNotFound(path.clone()))?,
            ),
            None => None,
        };
        let profile = self.profiles.load().ok();

        Ok(ResolvedContext {
            session,
            exercise,
            spec,
            profile,
            run_output,
            run_id,
        })
    }

    fn latest_run_output(&self, session_id: Uuid) -> Result<Option<RunOutput>, PairingError> {
        let runs = self
            .sessions
            .store()
            .list_runs(session_id)
            .map_err(|e| PairingError::Internal(e.to_string()))?;
        Ok(runs
            .into_iter()
            .rev()
            .find(|r| r.status == RunStatus::Completed)
            .and_then(|r| r.output))
    }

    fn check_cooldown(
        &self,
        session: &Session,
        level: InterventionLevel,
    ) -> Result<(), PairingError> {
        let now = Utc::now();
        if !session.can_request_intervention(level, now) {
            if !session.is_active() {
                return Err(PairingError::SessionNotActive);
            }
            return Err(PairingError::CooldownActive {
                remaining_seconds: session.cooldown_remaining(now),
            });
        }
        Ok(())
    }

    fn default_provider(&self) -> Result<Arc<dyn crate::providers::Provider>, PairingError> {
        self.providers
            .default_provider()
            .ok_or_else(|| PairingError::ProviderUnavailable("no provider registered".into()))
    }

    fn chat_request(&self, system: &str, user: &str) -> ChatRequest {
        ChatRequest {
            system: system.to_string(),
            user: user.to_string(),
            model: String::new(),
            temperature: self.llm.temperature,
            max_tokens: self.llm.max_tokens,
        }
    }

    async fn invoke(&self, system: &str, user: &str) -> Result<String, PairingError> {
        let provider = self.default_provider()?;
        provider
            .invoke(&self.chat_request(system, user))
            .await
            .map_err(map_provider_error)
    }

    /// Persist the intervention, mutate the session counters, and publish
    /// the delivery event — in that order, so the event never precedes
    /// durable state.
    async fn record_intervention(
        &self,
        ctx: &ResolvedContext,
        intent: Intent,
        level: InterventionLevel,
        kind: crate::domain::InterventionType,
        content: String,
    ) -> Result<Intervention, PairingError> {
        let now = Utc::now();
        let intervention = Intervention::new(
            ctx.session.id,
            ctx.run_id,
            intent,
            level,
            kind,
            content,
            now,
        );

        self.sessions
            .mutate(ctx.session.id, |s| {
                s.record_intervention(intent, level, now)
                    .map_err(PairingError::from)
            })
            .await?;
        self.sessions
            .store()
            .save_intervention(&intervention)
            .map_err(|e| PairingError::Internal(e.to_string()))?;

        self.bus.publish(&DomainEvent::InterventionDelivered {
            session_id: ctx.session.id,
            intervention_id: intervention.id,
            intent,
            level,
            kind,
        });

        Ok(intervention)
    }
}

fn selection_view<'a>(
    ctx: &'a ResolvedContext,
    focus_criterion: Option<&'a str>,
) -> SelectionContext<'a> {
    SelectionContext {
        exercise: ctx.exercise.as_ref(),
        profile: ctx.profile.as_ref(),
        run_output: ctx.run_output.as_ref(),
        spec: ctx.spec.as_ref(),
        focus_criterion,
        consecutive_same_level: ctx.session.consecutive_same_level,
    }
}

fn map_provider_error(e: ProviderError) -> PairingError {
    match e {
        ProviderError::Timeout { .. } => PairingError::UpstreamTimeout,
        other => PairingError::ProviderUnavailable(other.to_string()),
    }
}

fn map_sandbox_error(e: SandboxError) -> PairingError {
    match e {
        SandboxError::UnsupportedLanguage(_) | SandboxError::InvalidPath(_) => {
            PairingError::InvalidRequest(e.to_string())
        }
        SandboxError::Infrastructure(message) => PairingError::SandboxUnavailable(message),
    }
}
