//! Default stages backed by a [`Generator`] and a [`Scorer`].

use anyhow::Result;
use tracing::{debug, info};

use crate::agents::prompts::PromptEngine;
use crate::agents::{Stage, StageContext, StageKind, StageResult};
use crate::core::types::{ConductorState, Iteration};
use crate::io::generator::{Generator, Scorer};

pub struct LlmStages<G, S> {
    generator: G,
    scorer: S,
    prompts: PromptEngine,
}

impl<G: Generator, S: Scorer> LlmStages<G, S> {
    pub fn new(generator: G, scorer: S) -> Result<Self> {
        Ok(Self {
            generator,
            scorer,
            prompts: PromptEngine::new()?,
        })
    }

    fn outline(&self, state: &ConductorState, ctx: &StageContext<'_>) -> Result<StageResult> {
        let prompt = self.prompts.outliner(&state.task)?;
        ctx.deadline.check()?;
        let output = self
            .generator
            .generate(&prompt, state.next_iteration_number(), ctx.model)?;
        ctx.deadline.check()?;
        if output.trim().is_empty() {
            return Ok(StageResult::rejected(state.clone(), "empty outline"));
        }
        Ok(StageResult::ok(append(state, ctx, output, ctx.model)))
    }

    fn refine(&self, state: &ConductorState, ctx: &StageContext<'_>) -> Result<StageResult> {
        let index = ctx.slot.index.unwrap_or(1);
        let draft = state.last_output().unwrap_or(&state.task);
        let prompt = self
            .prompts
            .refiner(&state.task, draft, None, index, ctx.refiner_total)?;
        ctx.deadline.check()?;
        let mut output = self
            .generator
            .generate(&prompt, state.next_iteration_number(), ctx.model)?;
        ctx.deadline.check()?;
        let score = self.scorer.score(&output, &prompt)?;
        debug!(stage = %ctx.slot.tag(), score, "refiner scored");

        let mut model = ctx.model;
        let mut escalated = false;
        if score < ctx.thresholds.score_escalate_threshold && !state.escalation_used {
            ctx.deadline.check()?;
            let feedback = format!(
                "The previous revision scored {score:.0}/100, below {:.0}.",
                ctx.thresholds.score_escalate_threshold
            );
            let retry_prompt =
                self.prompts
                    .refiner(&state.task, draft, Some(&feedback), index, ctx.refiner_total)?;
            info!(stage = %ctx.slot.tag(), from = ctx.model, to = ctx.escalation_model, score, "escalating refiner");
            output = self.generator.generate(
                &retry_prompt,
                state.next_iteration_number(),
                ctx.escalation_model,
            )?;
            ctx.deadline.check()?;
            model = ctx.escalation_model;
            escalated = true;
        }

        if output.trim().is_empty() {
            return Ok(StageResult::rejected(state.clone(), "empty revision"));
        }
        let mut next = append(state, ctx, output, model);
        next.escalation_used |= escalated;
        Ok(StageResult::ok(next))
    }

    fn review(&self, state: &ConductorState, ctx: &StageContext<'_>) -> Result<StageResult> {
        let Some(draft) = state.last_output() else {
            return Ok(StageResult::rejected(state.clone(), "nothing to review"));
        };
        let prompt = self.prompts.reviewer(&state.task, draft)?;
        ctx.deadline.check()?;
        let notes = self
            .generator
            .generate(&prompt, state.next_iteration_number(), ctx.model)?;
        ctx.deadline.check()?;
        let score = self.scorer.score(draft, &prompt)?;
        debug!(stage = %ctx.slot.tag(), score, "reviewer scored draft");

        let next = append(state, ctx, notes, ctx.model);
        let stop = ctx.thresholds.score_stop_threshold;
        if score < stop {
            return Ok(StageResult::rejected(
                next,
                format!("review score {score:.1} below {stop:.1}"),
            ));
        }
        Ok(StageResult::ok(next))
    }
}

impl<G: Generator, S: Scorer> Stage for LlmStages<G, S> {
    fn run(&self, state: &ConductorState, ctx: &StageContext<'_>) -> Result<StageResult> {
        match ctx.slot.kind {
            StageKind::Outliner => self.outline(state, ctx),
            StageKind::Refiner => self.refine(state, ctx),
            StageKind::Reviewer => self.review(state, ctx),
        }
    }
}

fn append(
    state: &ConductorState,
    ctx: &StageContext<'_>,
    output: String,
    model: &str,
) -> ConductorState {
    let mut next = state.clone();
    next.iterations.push(Iteration {
        iteration: state.next_iteration_number(),
        output,
        model_used: model.to_string(),
    });
    next.steps.push(ctx.slot.tag());
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{StageSlot, StageStatus};
    use crate::core::budget::Deadline;
    use crate::io::config::IterationConfig;
    use crate::test_support::{ScriptedGenerator, ScriptedScorer};
    use std::time::Duration;

    fn ctx<'a>(slot: StageSlot, thresholds: &'a IterationConfig) -> StageContext<'a> {
        StageContext {
            slot,
            refiner_total: 3,
            deadline: Deadline::after(Duration::from_secs(5)),
            model: "grok-4.1",
            escalation_model: "claude-sonnet-4.5",
            thresholds,
        }
    }

    fn refiner(i: u32) -> StageSlot {
        StageSlot {
            kind: StageKind::Refiner,
            index: Some(i),
        }
    }

    fn drafted() -> ConductorState {
        let mut state = ConductorState::new("ship PRD", "uuid", "cid");
        state.iterations.push(Iteration {
            iteration: 1,
            output: "outline".to_string(),
            model_used: "grok-4.1".to_string(),
        });
        state.steps.push("outliner".to_string());
        state
    }

    #[test]
    fn refiner_escalates_once_on_low_score() {
        let generator = ScriptedGenerator::new(["weak", "strong", "weak again", "better"]);
        let scorer = ScriptedScorer::new([40.0, 40.0]);
        let stages = LlmStages::new(&generator, &scorer).expect("stages");
        let thresholds = IterationConfig::default();

        let first = stages
            .run(&drafted(), &ctx(refiner(1), &thresholds))
            .expect("run");
        assert_eq!(first.status, StageStatus::Ok);
        assert!(first.state.escalation_used);
        assert_eq!(first.state.last_output(), Some("strong"));
        assert_eq!(first.state.iterations[1].model_used, "claude-sonnet-4.5");
        assert_eq!(first.state.steps, vec!["outliner", "refiner:1"]);

        let second = stages
            .run(&first.state, &ctx(refiner(2), &thresholds))
            .expect("run");
        assert_eq!(second.state.last_output(), Some("weak again"));
        assert_eq!(generator.call_count(), 3);
    }

    #[test]
    fn reviewer_rejects_low_scoring_draft() {
        let generator = ScriptedGenerator::new(["needs metrics"]);
        let scorer = ScriptedScorer::new([55.0]);
        let stages = LlmStages::new(&generator, &scorer).expect("stages");
        let thresholds = IterationConfig::default();
        let slot = StageSlot {
            kind: StageKind::Reviewer,
            index: None,
        };

        let result = stages.run(&drafted(), &ctx(slot, &thresholds)).expect("run");

        assert_eq!(result.status, StageStatus::Rejected);
        assert_eq!(result.state.steps.last().map(String::as_str), Some("reviewer"));
        assert!(result.detail.is_some_and(|d| d.contains("55.0")));
    }

    #[test]
    fn expired_deadline_stops_before_generating() {
        let generator = ScriptedGenerator::repeating("x");
        let scorer = ScriptedScorer::repeating(90.0);
        let stages = LlmStages::new(&generator, &scorer).expect("stages");
        let thresholds = IterationConfig::default();
        let mut context = ctx(
            StageSlot {
                kind: StageKind::Outliner,
                index: None,
            },
            &thresholds,
        );
        context.deadline = Deadline::after(Duration::ZERO);

        assert!(stages.run(&drafted(), &context).is_err());
        assert_eq!(generator.call_count(), 0);
    }
}
