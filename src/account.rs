//! Account Resolver (spec.md §4.1; C2).
//!
//! Merges per-plugin base config with per-account overrides and resolves
//! credentials following the precedence in spec.md §4.1: explicit inline ->
//! tokenFile (read on demand, trimmed) -> environment variable specific to
//! this plugin/account (env only applies to the default account unless the
//! plugin opts in).

use crate::error::{ChannelError, Result};
use crate::{Account, AccountConfig, AccountId, Credentials, CredentialSource};

use std::collections::HashMap;
use std::path::PathBuf;

/// Raw per-account override record as it appears in config
/// (`channels.<id>.accounts.<accountId>`, spec.md §6).
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct AccountOverride {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    #[serde(default)]
    pub config: PartialAccountConfig,
}

/// Sparse override of `AccountConfig`: every field optional so the account
/// record can win only on the fields it actually sets (spec.md §4.1 `⊕`).
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct PartialAccountConfig {
    pub dm_policy: Option<crate::DmPolicy>,
    pub group_policy: Option<crate::GroupPolicy>,
    pub allow_from: Option<Vec<String>>,
    pub group_allow_from: Option<Vec<String>>,
    pub media_max_mb: Option<u64>,
    pub debounce_ms: Option<u64>,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl PartialAccountConfig {
    /// Shallow-merge `self` over `base`, with `self`'s present fields winning.
    fn merge_over(&self, base: &AccountConfig) -> AccountConfig {
        let mut merged = base.clone();
        if let Some(v) = self.dm_policy {
            merged.dm_policy = v;
        }
        if let Some(v) = self.group_policy {
            merged.group_policy = v;
        }
        if let Some(v) = &self.allow_from {
            merged.allow_from = v.clone();
        }
        if let Some(v) = &self.group_allow_from {
            merged.group_allow_from = v.clone();
        }
        if let Some(v) = self.media_max_mb {
            merged.media_max_mb = v;
        }
        if let Some(v) = self.debounce_ms {
            merged.debounce_ms = v;
        }
        for (k, v) in &self.extra {
            merged.extra.insert(k.clone(), v.clone());
        }
        merged
    }
}

/// Base (channel-wide) configuration a plugin is constructed with.
#[derive(Debug, Clone, Default)]
pub struct ChannelBaseConfig {
    pub enabled: bool,
    pub config: AccountConfig,
    pub accounts: HashMap<AccountId, AccountOverride>,
    pub default_account_id: Option<AccountId>,
}

/// An account after config merge and credential resolution, ready for a
/// plugin's `startAccount`.
#[derive(Debug, Clone)]
pub struct ResolvedAccount {
    pub account: Account,
}

/// Resolves accounts for a single channel plugin.
pub struct AccountResolver {
    /// Plugin id, used to build the env var name `<CHANNEL>_BOT_TOKEN`.
    channel: String,
    /// Whether this plugin opts in to env-var resolution for non-default
    /// accounts too (spec.md §4.1 default: only the default account).
    env_for_all_accounts: bool,
}

impl AccountResolver {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            env_for_all_accounts: false,
        }
    }

    pub fn with_env_for_all_accounts(mut self, value: bool) -> Self {
        self.env_for_all_accounts = value;
        self
    }

    /// List configured account ids (explicit overrides plus the implicit
    /// default account if none are configured).
    pub fn list_account_ids(&self, base: &ChannelBaseConfig) -> Vec<AccountId> {
        if base.accounts.is_empty() {
            vec![
                base.default_account_id
                    .clone()
                    .unwrap_or_else(|| AccountId::from("default")),
            ]
        } else {
            base.accounts.keys().cloned().collect()
        }
    }

    /// Merge base config with the account's override and resolve
    /// credentials (spec.md §4.1).
    pub fn resolve_account(
        &self,
        base: &ChannelBaseConfig,
        account_id: &AccountId,
    ) -> Result<ResolvedAccount> {
        let default_account_id = base
            .default_account_id
            .clone()
            .unwrap_or_else(|| AccountId::from("default"));
        let is_default_account = *account_id == default_account_id;

        let overrides = base.accounts.get(account_id).cloned().unwrap_or_default();

        let enabled = overrides.enabled.unwrap_or(base.enabled);
        let config = overrides.config.merge_over(&base.config);
        let credentials = self.resolve_credentials(&overrides, is_default_account)?;

        Ok(ResolvedAccount {
            account: Account {
                account_id: account_id.clone(),
                enabled,
                credentials,
                config,
            },
        })
    }

    fn resolve_credentials(
        &self,
        overrides: &AccountOverride,
        is_default_account: bool,
    ) -> Result<Credentials> {
        if let Some(token) = &overrides.token
            && !token.is_empty()
        {
            return Ok(Credentials {
                token: Some(token.clone()),
                source: CredentialSource::Config,
            });
        }

        if let Some(path) = &overrides.token_file {
            let contents = std::fs::read_to_string(path).map_err(|error| {
                ChannelError::Credentials(format!(
                    "failed to read token file {}: {error}",
                    path.display()
                ))
            })?;
            let token = contents.trim().to_string();
            if !token.is_empty() {
                return Ok(Credentials {
                    token: Some(token),
                    source: CredentialSource::ConfigFile,
                });
            }
        }

        if is_default_account || self.env_for_all_accounts {
            let env_var = format!("{}_BOT_TOKEN", self.channel.to_uppercase());
            if let Ok(token) = std::env::var(&env_var)
                && !token.is_empty()
            {
                return Ok(Credentials {
                    token: Some(token),
                    source: CredentialSource::Env,
                });
            }
        }

        Ok(Credentials {
            token: None,
            source: CredentialSource::None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_token_wins_over_file_and_env() {
        // SAFETY: test-only, single-threaded env mutation guarded by
        // `parking_lot`-free sequential execution within this test body.
        unsafe {
            std::env::set_var("TESTCHAN_BOT_TOKEN", "from-env");
        }

        let mut base = ChannelBaseConfig {
            enabled: true,
            ..Default::default()
        };
        base.accounts.insert(
            AccountId::from("default"),
            AccountOverride {
                token: Some("from-config".into()),
                ..Default::default()
            },
        );

        let resolver = AccountResolver::new("testchan");
        let resolved = resolver
            .resolve_account(&base, &AccountId::from("default"))
            .expect("resolve should succeed");

        assert_eq!(
            resolved.account.credentials.token.as_deref(),
            Some("from-config")
        );
        assert_eq!(resolved.account.credentials.source, CredentialSource::Config);

        unsafe {
            std::env::remove_var("TESTCHAN_BOT_TOKEN");
        }
    }

    #[test]
    fn env_fallback_applies_only_to_default_account() {
        unsafe {
            std::env::set_var("TESTCHAN2_BOT_TOKEN", "from-env");
        }

        let mut base = ChannelBaseConfig {
            enabled: true,
            ..Default::default()
        };
        base.accounts
            .insert(AccountId::from("default"), AccountOverride::default());
        base.accounts
            .insert(AccountId::from("secondary"), AccountOverride::default());

        let resolver = AccountResolver::new("testchan2");

        let default_resolved = resolver
            .resolve_account(&base, &AccountId::from("default"))
            .unwrap();
        assert_eq!(
            default_resolved.account.credentials.source,
            CredentialSource::Env
        );

        let secondary_resolved = resolver
            .resolve_account(&base, &AccountId::from("secondary"))
            .unwrap();
        assert_eq!(
            secondary_resolved.account.credentials.source,
            CredentialSource::None
        );

        unsafe {
            std::env::remove_var("TESTCHAN2_BOT_TOKEN");
        }
    }

    #[test]
    fn account_override_shallow_merges_over_base() {
        let mut base = ChannelBaseConfig {
            enabled: true,
            config: AccountConfig {
                dm_policy: crate::DmPolicy::Allowlist,
                allow_from: vec!["alice".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        base.accounts.insert(
            AccountId::from("default"),
            AccountOverride {
                config: PartialAccountConfig {
                    allow_from: Some(vec!["bob".into()]),
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        let resolver = AccountResolver::new("testchan3");
        let resolved = resolver
            .resolve_account(&base, &AccountId::from("default"))
            .unwrap();

        // allow_from came from the override, dm_policy is inherited from base.
        assert_eq!(resolved.account.config.allow_from, vec!["bob".to_string()]);
        assert_eq!(resolved.account.config.dm_policy, crate::DmPolicy::Allowlist);
    }
}
