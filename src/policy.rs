//! Policy Gate: evaluates DM/group admission policy, access-group
//! authorization, and pairing state for one inbound message.

use crate::error::{PolicyError, Result};
use crate::{AccountConfig, ChatType, DmPolicy, GroupPolicy};

/// Outcome of a policy decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Message proceeds to debounce/dispatch. `command_authorized` is
    /// attached to the delivery context.
    Allow { command_authorized: Option<bool> },
    /// Drop silently: policy disabled, allowlist miss, or an unauthorized
    /// group command.
    Drop,
    /// Unknown DM sender under `dmPolicy=pairing`: the gate issues a
    /// pairing reply and drops this message.
    RequirePairing,
}

/// Evaluates access policy for one inbound message.
///
/// `effective_allow_from` must already be the union of configured
/// `allowFrom` and the durable pairing allowlist.
pub struct PolicyGate;

impl PolicyGate {
    /// `is_authorized` resolves command authorization via the access-group
    /// evaluator (an external collaborator; the caller supplies the
    /// resolved bool, or `None` when the message is not a control command).
    pub fn evaluate(
        config: &AccountConfig,
        effective_allow_from: &[String],
        effective_group_allow_from: &[String],
        sender_id: &str,
        chat_type: ChatType,
        has_control_command: bool,
        is_authorized: Option<bool>,
    ) -> Decision {
        let normalized_sender = normalize(sender_id);

        match chat_type {
            ChatType::Direct => {
                match config.dm_policy {
                    DmPolicy::Disabled => return Decision::Drop,
                    DmPolicy::Pairing => {
                        if !contains_normalized(effective_allow_from, &normalized_sender) {
                            return Decision::RequirePairing;
                        }
                    }
                    DmPolicy::Allowlist => {
                        if !contains_normalized(effective_allow_from, &normalized_sender) {
                            return Decision::Drop;
                        }
                    }
                    DmPolicy::Open => {}
                }
            }
            ChatType::Group => {
                match config.group_policy {
                    GroupPolicy::Disabled => return Decision::Drop,
                    GroupPolicy::Allowlist => {
                        if effective_group_allow_from.is_empty()
                            || !contains_normalized(effective_group_allow_from, &normalized_sender)
                        {
                            return Decision::Drop;
                        }
                    }
                    GroupPolicy::Open => {}
                }

                if has_control_command && is_authorized == Some(false) {
                    return Decision::Drop;
                }
            }
        }

        let command_authorized = if has_control_command { is_authorized } else { None };
        Decision::Allow { command_authorized }
    }

    /// Same evaluation, returning a `Result` so callers that want `?`
    /// ergonomics can use `PolicyError` variants directly.
    pub fn evaluate_strict(
        channel: &str,
        config: &AccountConfig,
        effective_allow_from: &[String],
        effective_group_allow_from: &[String],
        sender_id: &str,
        chat_type: ChatType,
        has_control_command: bool,
        is_authorized: Option<bool>,
    ) -> Result<Option<bool>> {
        match Self::evaluate(
            config,
            effective_allow_from,
            effective_group_allow_from,
            sender_id,
            chat_type,
            has_control_command,
            is_authorized,
        ) {
            Decision::Allow { command_authorized } => Ok(command_authorized),
            Decision::RequirePairing => Ok(None),
            Decision::Drop => match chat_type {
                ChatType::Direct if config.dm_policy == DmPolicy::Disabled => {
                    Err(PolicyError::DmDisabled {
                        channel: channel.to_string(),
                    }
                    .into())
                }
                ChatType::Group if config.group_policy == GroupPolicy::Disabled => {
                    Err(PolicyError::GroupDisabled {
                        channel: channel.to_string(),
                    }
                    .into())
                }
                ChatType::Group if has_control_command => {
                    Err(PolicyError::UnauthorizedCommand.into())
                }
                _ => Err(PolicyError::Denied {
                    channel: channel.to_string(),
                    chat_type: chat_type.to_string(),
                }
                .into()),
            },
        }
    }
}

/// Canonicalizes a channel-specific peer identity (spec.md §4.2, P1):
/// lower-case and strip known transport prefixes (`mezon:`, `mz:`).
///
/// Invariant P1: `normalize(normalize(x)) == normalize(x)` — stripping a
/// prefix and lower-casing are both idempotent, so this holds by
/// construction.
pub fn normalize(id: &str) -> String {
    let lowered = id.to_lowercase();
    for prefix in ["mezon:", "mz:", "signal:", "slack:", "discord:", "sms:"] {
        if let Some(stripped) = lowered.strip_prefix(prefix) {
            return stripped.to_string();
        }
    }
    lowered
}

fn contains_normalized(allow_from: &[String], normalized_sender: &str) -> bool {
    allow_from
        .iter()
        .any(|entry| normalize(entry) == normalized_sender)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        for raw in ["Mezon:ABC123", "MZ:xyz", "PlainId", ""] {
            let once = normalize(raw);
            let twice = normalize(&once);
            assert_eq!(once, twice, "normalize should be idempotent for {raw:?}");
        }
    }

    #[test]
    fn dm_disabled_drops() {
        let config = AccountConfig {
            dm_policy: DmPolicy::Disabled,
            ..Default::default()
        };
        let decision = PolicyGate::evaluate(&config, &[], &[], "u1", ChatType::Direct, false, None);
        assert_eq!(decision, Decision::Drop);
    }

    #[test]
    fn dm_pairing_unknown_sender_requires_pairing() {
        let config = AccountConfig {
            dm_policy: DmPolicy::Pairing,
            ..Default::default()
        };
        let decision =
            PolicyGate::evaluate(&config, &[], &[], "u1", ChatType::Direct, false, None);
        assert_eq!(decision, Decision::RequirePairing);
    }

    #[test]
    fn dm_pairing_approved_sender_allows() {
        let config = AccountConfig {
            dm_policy: DmPolicy::Pairing,
            ..Default::default()
        };
        let decision = PolicyGate::evaluate(
            &config,
            &["U1".to_string()],
            &[],
            "u1",
            ChatType::Direct,
            false,
            None,
        );
        assert_eq!(
            decision,
            Decision::Allow {
                command_authorized: None
            }
        );
    }

    #[test]
    fn group_allowlist_empty_drops() {
        let config = AccountConfig {
            group_policy: GroupPolicy::Allowlist,
            ..Default::default()
        };
        let decision =
            PolicyGate::evaluate(&config, &[], &[], "u1", ChatType::Group, false, None);
        assert_eq!(decision, Decision::Drop);
    }

    #[test]
    fn group_unauthorized_command_drops() {
        let config = AccountConfig {
            group_policy: GroupPolicy::Open,
            ..Default::default()
        };
        let decision = PolicyGate::evaluate(
            &config,
            &[],
            &[],
            "u1",
            ChatType::Group,
            true,
            Some(false),
        );
        assert_eq!(decision, Decision::Drop);
    }

    #[test]
    fn group_authorized_command_allows_with_flag() {
        let config = AccountConfig {
            group_policy: GroupPolicy::Open,
            ..Default::default()
        };
        let decision =
            PolicyGate::evaluate(&config, &[], &[], "u1", ChatType::Group, true, Some(true));
        assert_eq!(
            decision,
            Decision::Allow {
                command_authorized: Some(true)
            }
        );
    }
}
