/// Asks the operator before doing something that costs money.
pub trait Confirmation: Send + Sync {
    /// Returns `true` only for an affirmative answer. Interruption or a
    /// closed input count as a refusal.
    fn confirm(&self, question: &str) -> bool;
}

/// Asks on the terminal with a `[y/N]` prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct Terminal;

impl Confirmation for Terminal {
    fn confirm(&self, question: &str) -> bool {
        let answer = dialoguer::Confirm::new()
            .with_prompt(question)
            .default(false)
            .interact();
        accepted(answer)
    }
}

/// Answers yes without asking (`--yes`).
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeYes;

impl Confirmation for AssumeYes {
    fn confirm(&self, question: &str) -> bool {
        tracing::info!("{} yes", question);
        true
    }
}

// no answer at all (ctrl-c, no terminal) is a refusal
fn accepted(answer: dialoguer::Result<bool>) -> bool {
    match answer {
        Ok(yes) => yes,
        Err(e) => {
            tracing::warn!("no answer: {}", e);
            false
        }
    }
}
