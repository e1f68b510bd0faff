//! Keyboard-Interactive Authentication
//!
//! Some bastions only offer challenge/response even for plain password
//! accounts. When the configured credential is a password we answer every
//! prompt of every round with that password.

use russh::client::{Handle, KeyboardInteractiveAuthResponse};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// Servers that keep asking after this many rounds are treated as a rejection
const MAX_KBI_ROUNDS: usize = 5;

/// Build the reply for one InfoRequest round
pub(crate) fn password_responses(prompt_count: usize, password: &str) -> Vec<String> {
    vec![password.to_string(); prompt_count]
}

/// Run keyboard-interactive auth, answering every prompt with `password`.
///
/// Returns `Ok(true)` on success, `Ok(false)` if the server rejected us.
pub async fn authenticate_with_password(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    password: &str,
) -> Result<bool, SshError> {
    let mut response = handle
        .authenticate_keyboard_interactive_start(username, None::<String>)
        .await
        .map_err(|e| SshError::AuthenticationFailed(format!("KBI start failed: {}", e)))?;

    for round in 1..=MAX_KBI_ROUNDS {
        match response {
            KeyboardInteractiveAuthResponse::Success => {
                info!("Keyboard-interactive authentication successful");
                return Ok(true);
            }
            KeyboardInteractiveAuthResponse::Failure { .. } => {
                warn!("Keyboard-interactive authentication rejected");
                return Ok(false);
            }
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                debug!(
                    "KBI round {}: {} prompt(s): {:?}",
                    round,
                    prompts.len(),
                    prompts.iter().map(|p| p.prompt.as_str()).collect::<Vec<_>>()
                );
                response = handle
                    .authenticate_keyboard_interactive_respond(password_responses(
                        prompts.len(),
                        password,
                    ))
                    .await
                    .map_err(|e| {
                        SshError::AuthenticationFailed(format!("KBI respond failed: {}", e))
                    })?;
            }
        }
    }

    warn!(
        "Keyboard-interactive authentication gave up after {} rounds",
        MAX_KBI_ROUNDS
    );
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_responses_match_prompt_count() {
        assert_eq!(password_responses(2, "pw"), vec!["pw", "pw"]);
        assert!(password_responses(0, "pw").is_empty());
    }
}
