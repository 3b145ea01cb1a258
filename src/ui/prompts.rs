//! Interactive prompts with a CI fallback

use super::context::UiContext;
use crate::error::{RiggerError, RiggerResult};

/// Ask a yes/no question. `--yes` answers it, non-interactive sessions get
/// `default` without blocking.
pub async fn confirm(ctx: &UiContext, message: &str, default: bool) -> RiggerResult<bool> {
    if ctx.auto_yes() {
        println!("  {} (auto-approved)", message);
        return Ok(true);
    }

    if !ctx.is_interactive() {
        return Ok(default);
    }

    let message = message.to_string();
    let answer = tokio::task::spawn_blocking(move || {
        cliclack::confirm(&message).initial_value(default).interact()
    })
    .await
    .map_err(|e| RiggerError::Prompt(format!("prompt task failed: {e}")))?;

    answer.map_err(|e| RiggerError::Prompt(e.to_string()))
}
