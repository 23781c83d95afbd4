//! Stage prompts rendered with minijinja.

use anyhow::{Context, Result};
use minijinja::{Environment, context};

const OUTLINER_TEMPLATE: &str = include_str!("prompts/outliner.md");
const REFINER_TEMPLATE: &str = include_str!("prompts/refiner.md");
const REVIEWER_TEMPLATE: &str = include_str!("prompts/reviewer.md");

pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("outliner", OUTLINER_TEMPLATE)
            .context("outliner template")?;
        env.add_template("refiner", REFINER_TEMPLATE)
            .context("refiner template")?;
        env.add_template("reviewer", REVIEWER_TEMPLATE)
            .context("reviewer template")?;
        Ok(Self { env })
    }

    pub fn outliner(&self, task: &str) -> Result<String> {
        let template = self.env.get_template("outliner")?;
        Ok(template.render(context! { task => task.trim() })?)
    }

    pub fn refiner(
        &self,
        task: &str,
        draft: &str,
        feedback: Option<&str>,
        index: u32,
        total: u32,
    ) -> Result<String> {
        let template = self.env.get_template("refiner")?;
        Ok(template.render(context! {
            task => task.trim(),
            draft => draft.trim(),
            feedback => feedback.map(str::trim).filter(|s| !s.is_empty()),
            index => index,
            total => total,
        })?)
    }

    pub fn reviewer(&self, task: &str, draft: &str) -> Result<String> {
        let template = self.env.get_template("reviewer")?;
        Ok(template.render(context! {
            task => task.trim(),
            draft => draft.trim(),
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refiner_prompt_includes_draft_and_optional_feedback() {
        let engine = PromptEngine::new().expect("engine");
        let with = engine
            .refiner("ship PRD", "draft v1", Some("missing metrics"), 2, 3)
            .expect("render");
        assert!(with.contains("refiner pass 2 of 3"));
        assert!(with.contains("draft v1"));
        assert!(with.contains("missing metrics"));

        let without = engine.refiner("ship PRD", "draft v1", None, 1, 3).expect("render");
        assert!(!without.contains("Reviewer notes"));
    }

    #[test]
    fn outliner_prompt_embeds_task() {
        let engine = PromptEngine::new().expect("engine");
        let rendered = engine.outliner("  plan the migration  ").expect("render");
        assert!(rendered.contains("\nplan the migration\n"));
    }
}
