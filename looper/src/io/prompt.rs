//! Prompt builder for agent invocations.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::core::types::ExecutionMode;

const ITERATION_TEMPLATE: &str = include_str!("prompts/iteration.md");
const RESUME_TEMPLATE: &str = include_str!("prompts/resume.md");
const VERIFICATION_TEMPLATE: &str = include_str!("prompts/verification.md");
const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");

/// Produces the text sent to the agent.
pub trait PromptSource: Send + Sync {
    fn iteration_prompt(
        &self,
        mode: ExecutionMode,
        iteration_index: u32,
        instructions: &str,
    ) -> Result<String>;

    /// First iteration after a failed verification.
    fn resume_prompt(
        &self,
        mode: ExecutionMode,
        iteration_index: u32,
        instructions: &str,
        gaps: &[String],
    ) -> Result<String>;

    fn verification_prompt(&self, instructions: &str, report_path: &Path) -> Result<String>;

    /// Standing context passed alongside every prompt (status file contract).
    fn system_context(&self, mode: ExecutionMode, status_path: &Path) -> Result<String>;
}

/// Embedded minijinja templates.
pub struct TemplatePrompts {
    env: Environment<'static>,
}

impl TemplatePrompts {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("iteration", ITERATION_TEMPLATE)
            .context("load iteration template")?;
        env.add_template("resume", RESUME_TEMPLATE)
            .context("load resume template")?;
        env.add_template("verification", VERIFICATION_TEMPLATE)
            .context("load verification template")?;
        env.add_template("system", SYSTEM_TEMPLATE)
            .context("load system template")?;
        Ok(Self { env })
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let template = self.env.get_template(name)?;
        let rendered = template
            .render(ctx)
            .with_context(|| format!("render {name} prompt"))?;
        Ok(rendered)
    }
}

impl PromptSource for TemplatePrompts {
    fn iteration_prompt(
        &self,
        mode: ExecutionMode,
        iteration_index: u32,
        instructions: &str,
    ) -> Result<String> {
        self.render(
            "iteration",
            context! {
                mode => mode.as_str(),
                iteration => iteration_index + 1,
                instructions => instructions.trim(),
            },
        )
    }

    fn resume_prompt(
        &self,
        mode: ExecutionMode,
        iteration_index: u32,
        instructions: &str,
        gaps: &[String],
    ) -> Result<String> {
        self.render(
            "resume",
            context! {
                mode => mode.as_str(),
                iteration => iteration_index + 1,
                instructions => instructions.trim(),
                gaps => gaps,
            },
        )
    }

    fn verification_prompt(&self, instructions: &str, report_path: &Path) -> Result<String> {
        self.render(
            "verification",
            context! {
                instructions => instructions.trim(),
                report_path => report_path.display().to_string(),
            },
        )
    }

    fn system_context(&self, mode: ExecutionMode, status_path: &Path) -> Result<String> {
        let sibling = |name: &str| {
            status_path
                .parent()
                .map(|dir| dir.join(name).display().to_string())
                .unwrap_or_else(|| name.to_string())
        };
        self.render(
            "system",
            context! {
                mode => mode.as_str(),
                status_path => status_path.display().to_string(),
                schema_path => sibling("status.schema.json"),
                stop_path => sibling("STOP"),
            },
        )
    }
}

/// Task instructions, which must exist and be non-empty.
pub fn read_instructions(path: &Path) -> Result<String> {
    let contents = fs::read_to_string(path).with_context(|| {
        format!(
            "read instructions {} (run `looper init` first)",
            path.display()
        )
    })?;
    if contents.trim().is_empty() {
        anyhow::bail!("instructions file {} is empty", path.display());
    }
    Ok(contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_prompt_is_mode_specific() {
        let prompts = TemplatePrompts::new().expect("templates");
        let incremental = prompts
            .iteration_prompt(ExecutionMode::Incremental, 0, "Port the parser.\n")
            .expect("render");
        assert!(incremental.starts_with("# Iteration 1 of"));
        assert!(incremental.contains("Port the parser."));
        assert!(incremental.contains("progress.completed"));

        let autonomous = prompts
            .iteration_prompt(ExecutionMode::Autonomous, 4, "Keep docs fresh.")
            .expect("render");
        assert!(autonomous.starts_with("# Iteration 5 of"));
        assert!(autonomous.contains("`worked`"));
        assert!(!autonomous.contains("progress.completed"));
    }

    #[test]
    fn resume_prompt_lists_gaps() {
        let prompts = TemplatePrompts::new().expect("templates");
        let gaps = vec!["README missing".to_string(), "tests fail".to_string()];
        let prompt = prompts
            .resume_prompt(ExecutionMode::Incremental, 2, "Ship it.", &gaps)
            .expect("render");
        assert!(prompt.contains("- README missing\n- tests fail"));

        let empty = prompts
            .resume_prompt(ExecutionMode::Incremental, 2, "Ship it.", &[])
            .expect("render");
        assert!(empty.contains("did not list specific gaps"));
    }

    #[test]
    fn verification_prompt_names_report_path() {
        let prompts = TemplatePrompts::new().expect("templates");
        let prompt = prompts
            .verification_prompt("Ship it.", Path::new("/work/.looper/verification.md"))
            .expect("render");
        assert!(prompt.contains("`/work/.looper/verification.md`"));
        assert!(prompt.contains("VERDICT: pass | fail | needs_review"));
    }

    #[test]
    fn system_context_points_at_status_contract() {
        let prompts = TemplatePrompts::new().expect("templates");
        let context = prompts
            .system_context(ExecutionMode::Autonomous, Path::new("/work/.looper/status.json"))
            .expect("render");
        assert!(context.contains("/work/.looper/status.json"));
        assert!(context.contains("/work/.looper/status.schema.json"));
        assert!(context.contains("\"worked\": true"));
    }

    #[test]
    fn empty_instructions_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("INSTRUCTIONS.md");
        assert!(read_instructions(&path).is_err());
        fs::write(&path, "  \n").expect("write");
        assert!(read_instructions(&path).is_err());
        fs::write(&path, "Do the thing.\n").expect("write");
        assert_eq!(read_instructions(&path).expect("read"), "Do the thing.\n");
    }
}
