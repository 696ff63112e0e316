//! Control-command detection and access-group authorization (spec.md §4.2,
//! §6 `commands.useAccessGroups`; GLOSSARY "Control command").
//!
//! The real access-group evaluator (a Cedar-style policy engine) is out of
//! scope for this core; this module only owns the seam the Policy Gate
//! calls through, grounded in the teacher's slash-command permission check
//! in `messaging/slack.rs::handle_command_event` — a command is checked
//! against an authorization source before it is allowed to reach the agent,
//! and an unauthorized one is dropped rather than answered.

use async_trait::async_trait;

/// A control command is a message that starts with `/`, mirroring the
/// slash-command convention every channel plugin already speaks natively
/// (Slack's own `/ask`-style commands, and the equivalent in-band prefix
/// used by the other transports).
pub fn is_control_command(text: &str) -> bool {
    text.trim_start().starts_with('/')
}

/// Extracts the command token (without the leading `/`), e.g. `"/reset now"`
/// -> `Some("reset")`. Returns `None` for non-commands.
pub fn command_token(text: &str) -> Option<&str> {
    let trimmed = text.trim_start();
    let rest = trimmed.strip_prefix('/')?;
    Some(rest.split_whitespace().next().unwrap_or(""))
}

/// Decides whether `sender_id` is authorized to invoke `command` on a given
/// channel/account. Implemented once per deployment's access-control
/// backend; the gateway core only needs the yes/no answer.
#[async_trait]
pub trait AccessGroupEvaluator: Send + Sync {
    async fn authorize(&self, channel: &str, account_id: &str, sender_id: &str, command: &str) -> bool;
}

/// Used when `commands.useAccessGroups` is `false`: every control command
/// is authorized, same as the teacher's default-allow fallback for commands
/// that have no explicit deny rule configured.
pub struct AllowAllEvaluator;

#[async_trait]
impl AccessGroupEvaluator for AllowAllEvaluator {
    async fn authorize(&self, _channel: &str, _account_id: &str, _sender_id: &str, _command: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_leading_slash_as_control_command() {
        assert!(is_control_command("/reset"));
        assert!(is_control_command("  /reset now"));
        assert!(!is_control_command("hello"));
        assert!(!is_control_command(""));
    }

    #[test]
    fn extracts_command_token() {
        assert_eq!(command_token("/reset now"), Some("reset"));
        assert_eq!(command_token("/status"), Some("status"));
        assert_eq!(command_token("hello"), None);
    }

    #[tokio::test]
    async fn allow_all_evaluator_always_authorizes() {
        let evaluator = AllowAllEvaluator;
        assert!(evaluator.authorize("mezon", "default", "u1", "reset").await);
    }
}
