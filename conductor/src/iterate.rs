//! The generate → score → escalate → retry loop.
//!
//! Two variants share one engine:
//!
//! - [`IterationEngine::iterate_prompt`] starts on the routed model, bounds each
//!   iteration's tokens separately, and switches to a single escalation model.
//! - [`IterationEngine::adaptive_iterate`] bounds tokens across the whole run,
//!   walks a fixed escalation chain at most `max_escalations` times, and
//!   discounts the first score after each switch.
//!
//! Operational failures never surface as `Err`: every exit is an
//! [`IterationOutcome`] that keeps the iterations produced so far.

use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::pruning::{KeywordRelevance, PruneInput, PruneOptions, PruneStatus, prune_context};
use crate::core::routing::{CostTier, Decision, PrivacyLevel, RouteRequest, route};
use crate::core::tokens::estimate_tokens;
use crate::core::types::{Iteration, RunContext, id_or_new};
use crate::io::config::{EngineConfig, Toggles};
use crate::io::generator::{Generator, Scorer};
use crate::io::resume::{ResumeRecord, ResumeStore};

/// Blocking pause between attempts.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

impl<T: Sleeper + ?Sized> Sleeper for &T {
    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Input to [`IterationEngine::iterate_prompt`].
#[derive(Debug, Clone, Default)]
pub struct IterateRequest {
    pub task: String,
    pub branch: Option<String>,
    pub correlation_id: Option<String>,
    pub resume_token: Option<String>,
    pub human_feedback: Option<String>,
    /// Persist a resume token and return without iterating.
    pub pause: bool,
    pub research_requested: bool,
    pub requires_live_data: bool,
    pub privacy_level: PrivacyLevel,
    pub max_cost_tier: CostTier,
}

impl IterateRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }
}

/// Input to [`IterationEngine::adaptive_iterate`].
#[derive(Debug, Clone, Default)]
pub struct AdaptiveRequest {
    pub task: String,
    pub branch: Option<String>,
    pub correlation_id: Option<String>,
    pub resume_token: Option<String>,
    pub human_feedback: Option<String>,
    pub pause: bool,
    /// Defaults to the first entry of the escalation chain.
    pub start_model: Option<String>,
}

impl AdaptiveRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    TokenBudgetExceeded,
    IterationCap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationErrorReason {
    UnknownResumeToken,
    GenerationFailed,
    ScoringFailed,
    ResumeStoreFailed,
}

/// State shared by every outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationReport {
    pub correlation_id: String,
    pub model_used: String,
    pub iterations: Vec<Iteration>,
    pub final_output: Option<String>,
    pub score: Option<f64>,
    pub escalations: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IterationOutcome {
    Completed {
        #[serde(flatten)]
        report: IterationReport,
    },
    Aborted {
        reason: AbortReason,
        #[serde(flatten)]
        report: IterationReport,
    },
    Paused {
        resume_token: String,
        #[serde(flatten)]
        report: IterationReport,
    },
    Error {
        reason: IterationErrorReason,
        detail: String,
        #[serde(flatten)]
        report: IterationReport,
    },
}

impl IterationOutcome {
    pub fn report(&self) -> &IterationReport {
        match self {
            Self::Completed { report }
            | Self::Aborted { report, .. }
            | Self::Paused { report, .. }
            | Self::Error { report, .. } => report,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Aborted { .. } => "aborted",
            Self::Paused { .. } => "paused",
            Self::Error { .. } => "error",
        }
    }
}

/// Task, branch and model after an optional resume.
struct Start {
    task: String,
    branch: Option<String>,
    correlation_id: String,
    resumed_model: Option<String>,
}

/// How a run picks its next model after a weak score.
enum Escalation<'a> {
    /// Switch once to a fixed target (`None` disables escalation).
    Fixed(Option<&'a str>),
    /// Walk the chain, at most `max` times, discounting the next score.
    Chain {
        chain: &'a [String],
        max: u32,
        penalty: f64,
    },
}

enum Budget {
    PerIteration(usize),
    Cumulative(usize),
}

pub struct IterationEngine<G, S, Z = ThreadSleeper> {
    generator: G,
    scorer: S,
    sleeper: Z,
    config: EngineConfig,
    toggles: Toggles,
    resume: ResumeStore,
}

impl<G: Generator, S: Scorer> IterationEngine<G, S, ThreadSleeper> {
    pub fn new(generator: G, scorer: S, config: EngineConfig, resume: ResumeStore) -> Self {
        Self {
            generator,
            scorer,
            sleeper: ThreadSleeper,
            config,
            toggles: Toggles::default(),
            resume,
        }
    }
}

impl<G: Generator, S: Scorer, Z: Sleeper> IterationEngine<G, S, Z> {
    pub fn with_sleeper<Z2: Sleeper>(self, sleeper: Z2) -> IterationEngine<G, S, Z2> {
        IterationEngine {
            generator: self.generator,
            scorer: self.scorer,
            sleeper,
            config: self.config,
            toggles: self.toggles,
            resume: self.resume,
        }
    }

    pub fn with_toggles(mut self, toggles: Toggles) -> Self {
        self.toggles = toggles;
        self
    }

    /// Fixed-cap loop on the routed model.
    #[instrument(skip_all, fields(correlation_id = request.correlation_id.as_deref().unwrap_or("")))]
    pub fn iterate_prompt(&self, request: &IterateRequest) -> IterationOutcome {
        let start = match self.resolve_start(
            &request.task,
            request.branch.as_deref(),
            request.correlation_id.as_deref(),
            request.resume_token.as_deref(),
        ) {
            Ok(start) => start,
            Err(outcome) => return *outcome,
        };
        let base = with_feedback(&start.task, request.human_feedback.as_deref());

        let decision = route(
            &RouteRequest {
                text: base.clone(),
                research_requested: request.research_requested,
                requires_live_data: request.requires_live_data,
                privacy_level: request.privacy_level,
                max_cost_tier: request.max_cost_tier,
            },
            &self.config.routing,
        );
        let model = start
            .resumed_model
            .clone()
            .unwrap_or_else(|| decision.model_id.clone());
        info!(model = %model, reason = %decision.reason, "routed start model");

        let mut ctx = RunContext::new(start.correlation_id.clone(), model)
            .with_branch(start.branch.clone());
        if request.pause {
            return self.pause(&start, &ctx);
        }

        let escalation_model = self
            .toggles
            .escalate_llm
            .clone()
            .unwrap_or_else(|| self.config.iteration.escalation_model.clone());
        let escalation = if decision.max_loops == Some(0) {
            Escalation::Fixed(None)
        } else {
            Escalation::Fixed(Some(escalation_model.as_str()))
        };
        let cap = loop_cap(self.config.iteration.iteration_cap, &decision);
        self.run_loop(
            &mut ctx,
            &base,
            cap,
            escalation,
            Budget::PerIteration(self.config.iteration.token_budget),
        )
    }

    /// Chain-escalating loop with a run-wide token budget.
    #[instrument(skip_all, fields(correlation_id = request.correlation_id.as_deref().unwrap_or("")))]
    pub fn adaptive_iterate(&self, request: &AdaptiveRequest) -> IterationOutcome {
        let start = match self.resolve_start(
            &request.task,
            request.branch.as_deref(),
            request.correlation_id.as_deref(),
            request.resume_token.as_deref(),
        ) {
            Ok(start) => start,
            Err(outcome) => return *outcome,
        };
        let base = with_feedback(&start.task, request.human_feedback.as_deref());
        let chain = &self.config.adaptive.escalation_chain;
        let model = start
            .resumed_model
            .clone()
            .or_else(|| request.start_model.clone())
            .or_else(|| chain.first().cloned())
            .unwrap_or_else(|| self.config.routing.complex_model.clone());

        let mut ctx = RunContext::new(start.correlation_id.clone(), model)
            .with_branch(start.branch.clone());
        if request.pause {
            return self.pause(&start, &ctx);
        }

        self.run_loop(
            &mut ctx,
            &base,
            self.config.iteration.iteration_cap,
            Escalation::Chain {
                chain,
                max: self.config.adaptive.max_escalations,
                penalty: self.config.adaptive.post_escalation_penalty,
            },
            Budget::Cumulative(self.config.adaptive.total_token_budget),
        )
    }

    fn resolve_start(
        &self,
        task: &str,
        branch: Option<&str>,
        correlation_id: Option<&str>,
        resume_token: Option<&str>,
    ) -> Result<Start, Box<IterationOutcome>> {
        let Some(token) = resume_token else {
            return Ok(Start {
                task: task.to_string(),
                branch: branch.map(str::to_string),
                correlation_id: id_or_new(correlation_id),
                resumed_model: None,
            });
        };
        let fail = |reason, detail: String| {
            let cid = id_or_new(correlation_id);
            Box::new(IterationOutcome::Error {
                reason,
                detail,
                report: empty_report(cid, String::new()),
            })
        };
        match self.resume.take(token) {
            Ok(Some(record)) => {
                info!(token, correlation_id = %record.correlation_id, "resuming paused run");
                Ok(Start {
                    task: record.task,
                    branch: branch.map(str::to_string).or(record.branch),
                    correlation_id: correlation_id
                        .filter(|c| !c.trim().is_empty())
                        .map(str::to_string)
                        .unwrap_or(record.correlation_id),
                    resumed_model: Some(record.model_used),
                })
            }
            Ok(None) => {
                warn!(token, "unknown resume token");
                Err(fail(
                    IterationErrorReason::UnknownResumeToken,
                    format!("no paused run for token '{token}'"),
                ))
            }
            Err(err) => Err(fail(IterationErrorReason::ResumeStoreFailed, format!("{err:#}"))),
        }
    }

    fn pause(&self, start: &Start, ctx: &RunContext) -> IterationOutcome {
        let record = ResumeRecord::new(
            start.task.clone(),
            start.branch.clone(),
            ctx.correlation_id.clone(),
            ctx.model_used.clone(),
        );
        let report = empty_report(ctx.correlation_id.clone(), ctx.model_used.clone());
        match self.resume.save(&record) {
            Ok(()) => {
                info!(token = %record.token, "run paused");
                IterationOutcome::Paused {
                    resume_token: record.token,
                    report,
                }
            }
            Err(err) => IterationOutcome::Error {
                reason: IterationErrorReason::ResumeStoreFailed,
                detail: format!("{err:#}"),
                report,
            },
        }
    }

    fn run_loop(
        &self,
        ctx: &mut RunContext,
        base: &str,
        cap: u32,
        escalation: Escalation<'_>,
        budget: Budget,
    ) -> IterationOutcome {
        let iteration_cfg = &self.config.iteration;
        let mut iterations: Vec<Iteration> = Vec::new();
        let mut spent = 0usize;
        let mut escalations = 0u32;
        let mut pending_penalty: Option<f64> = None;
        let mut last_score: Option<f64> = None;
        let mut context = base.to_string();

        for n in 1..=cap {
            let prompt = self.fit_window(base, &context);
            let model = ctx.model_used.clone();
            let report = |iterations: &[Iteration], score, escalations| IterationReport {
                correlation_id: ctx.correlation_id.clone(),
                model_used: model.clone(),
                final_output: iterations.last().map(|i| i.output.clone()),
                iterations: iterations.to_vec(),
                score,
                escalations,
            };

            let output = match self.generator.generate(&prompt, n, &model) {
                Ok(output) => output,
                Err(err) => {
                    warn!(iteration = n, model = %model, error = %err, "generation failed");
                    return IterationOutcome::Error {
                        reason: IterationErrorReason::GenerationFailed,
                        detail: format!("{err:#}"),
                        report: report(&iterations, last_score, escalations),
                    };
                }
            };
            let output_tokens = estimate_tokens(&output);
            let used = estimate_tokens(&prompt) + output_tokens;
            iterations.push(Iteration {
                iteration: n,
                output: output.clone(),
                model_used: model.clone(),
            });

            let over_budget = match budget {
                Budget::PerIteration(limit) => used > limit,
                Budget::Cumulative(limit) => {
                    spent += used;
                    spent > limit
                }
            };
            if over_budget {
                warn!(iteration = n, used, spent, "token budget exceeded");
                return IterationOutcome::Aborted {
                    reason: AbortReason::TokenBudgetExceeded,
                    report: report(&iterations, last_score, escalations),
                };
            }

            let raw = match self.scorer.score(&output, &prompt) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(iteration = n, error = %err, "scoring failed");
                    return IterationOutcome::Error {
                        reason: IterationErrorReason::ScoringFailed,
                        detail: format!("{err:#}"),
                        report: report(&iterations, last_score, escalations),
                    };
                }
            };
            let score = match pending_penalty.take() {
                Some(factor) => (raw * factor).clamp(0.0, 100.0),
                None => raw,
            };
            last_score = Some(score);
            debug!(iteration = n, model = %model, score, output_tokens, "scored iteration");

            if score >= iteration_cfg.score_stop_threshold {
                info!(iteration = n, model = %model, score, "iteration completed");
                return IterationOutcome::Completed {
                    report: report(&iterations, last_score, escalations),
                };
            }

            let weak = score < iteration_cfg.score_escalate_threshold
                || output_tokens > iteration_cfg.escalate_output_tokens;
            if weak {
                match &escalation {
                    Escalation::Fixed(Some(target)) if *target != model => {
                        info!(from = %model, to = %target, score, "escalating model");
                        ctx.model_used = target.to_string();
                        escalations += 1;
                    }
                    Escalation::Chain {
                        chain,
                        max,
                        penalty,
                    } if escalations < *max => {
                        if let Some(next) = next_in_chain(chain, &model) {
                            info!(from = %model, to = %next, score, "escalating along chain");
                            ctx.model_used = next.to_string();
                            escalations += 1;
                            pending_penalty = Some(*penalty);
                        }
                    }
                    _ => {}
                }
            }

            context = format!("{base}\n\nPrevious attempt:\n{output}");
            if n < cap {
                let pause = iteration_cfg.backoff_after(n);
                debug!(iteration = n, backoff_ms = pause.as_millis() as u64, "backing off");
                self.sleeper.sleep(pause);
            }
        }

        warn!(cap, "iteration cap reached");
        IterationOutcome::Aborted {
            reason: AbortReason::IterationCap,
            report: IterationReport {
                correlation_id: ctx.correlation_id.clone(),
                model_used: ctx.model_used.clone(),
                final_output: iterations.last().map(|i| i.output.clone()),
                iterations,
                score: last_score,
                escalations,
            },
        }
    }

    /// Prune `context` when it would overflow the model window.
    fn fit_window(&self, query: &str, context: &str) -> String {
        let window = self.config.iteration.context_window_tokens;
        if estimate_tokens(context) <= window {
            return context.to_string();
        }
        let options = PruneOptions {
            target_tokens: window,
            min_keep_tokens: self.config.pruning.min_keep_tokens.min(window),
            max_age_days: self.config.pruning.max_age_days,
            today: Utc::now().date_naive(),
        };
        let input = PruneInput::Text(context.to_string());
        let outcome = prune_context(&input, &options, &KeywordRelevance::new(query));
        match outcome.status {
            PruneStatus::Pruned => {
                info!(tokens = outcome.token_count, window, "pruned context to fit window");
                outcome.context.render()
            }
            status => {
                warn!(?status, window, "context exceeds window and could not be pruned");
                context.to_string()
            }
        }
    }
}

/// Entry after `model` in `chain`, wrapping to the front. Unknown models start the chain.
pub fn next_in_chain<'a>(chain: &'a [String], model: &str) -> Option<&'a str> {
    if chain.is_empty() {
        return None;
    }
    let next = match chain.iter().position(|m| m == model) {
        Some(idx) => &chain[(idx + 1) % chain.len()],
        None => &chain[0],
    };
    Some(next.as_str())
}

/// Iterations allowed for a routed run: `1 + max_loops`, never above `cap`.
pub fn loop_cap(cap: u32, decision: &Decision) -> u32 {
    match decision.max_loops {
        Some(extra) => cap.min(extra.saturating_add(1)),
        None => cap,
    }
}

fn with_feedback(task: &str, feedback: Option<&str>) -> String {
    match feedback.map(str::trim).filter(|f| !f.is_empty()) {
        Some(feedback) => format!("{task}\n\nHuman feedback:\n{feedback}"),
        None => task.to_string(),
    }
}

fn empty_report(correlation_id: String, model_used: String) -> IterationReport {
    IterationReport {
        correlation_id,
        model_used,
        iterations: Vec::new(),
        final_output: None,
        score: None,
        escalations: 0,
    }
}
