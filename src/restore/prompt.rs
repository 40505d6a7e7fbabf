// campus-backup/src/restore/prompt.rs
use anyhow::Result;
use dialoguer::{Confirm, Input, Select};

/// Whoever answers questions during an interactive run.
pub trait Operator {
    /// Index of the chosen item, or `None` if the operator backed out.
    fn choose(&self, prompt: &str, items: &[String]) -> Result<Option<usize>>;
    fn confirm(&self, prompt: &str, default: bool) -> Result<bool>;
    fn ask(&self, prompt: &str) -> Result<String>;
}

/// Prompts on the controlling terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalOperator;

impl Operator for TerminalOperator {
    fn choose(&self, prompt: &str, items: &[String]) -> Result<Option<usize>> {
        Ok(Select::new()
            .with_prompt(prompt)
            .items(items)
            .default(0)
            .interact_opt()?)
    }

    fn confirm(&self, prompt: &str, default: bool) -> Result<bool> {
        Ok(Confirm::new().with_prompt(prompt).default(default).interact()?)
    }

    fn ask(&self, prompt: &str) -> Result<String> {
        Ok(Input::<String>::new().with_prompt(prompt).interact_text()?)
    }
}
