//! Gateway configuration (spec.md §6).
//!
//! Loaded via the `config` crate layering environment variables over a TOML
//! document, following the teacher's `dirs`-based data-directory
//! convention (`Config::load` in the teacher's `config.rs`). The parts that
//! can change without a restart -- per-channel account config and
//! `commands.useAccessGroups` -- live behind `arc_swap::ArcSwap`, the same
//! way the teacher holds its permission tables and agent links hot-swappable
//! across a config reload; a `notify` watcher calls `reload()` on file
//! change.

use crate::account::{AccountOverride, ChannelBaseConfig};
use crate::error::{ConfigError, Result};
use crate::{AccountConfig, AccountId, AgentId};

use arc_swap::ArcSwap;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Raw document shape deserialized from `gateway.toml` / environment
/// (spec.md §6 "Configuration").
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigDocument {
    #[serde(default)]
    channels: HashMap<String, ChannelDocument>,
    #[serde(default)]
    session: SessionConfig,
    #[serde(default)]
    commands: CommandsConfig,
    #[serde(default)]
    agents: AgentsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ChannelDocument {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    default_account_id: Option<AccountId>,
    #[serde(default)]
    accounts: HashMap<AccountId, AccountOverride>,
    #[serde(flatten)]
    config: AccountConfig,
}

impl From<ChannelDocument> for ChannelBaseConfig {
    fn from(doc: ChannelDocument) -> Self {
        ChannelBaseConfig {
            enabled: doc.enabled,
            config: doc.config,
            accounts: doc.accounts,
            default_account_id: doc.default_account_id,
        }
    }
}

/// `session.store` (spec.md §6): directory holding one JSON document per
/// agent's session entries.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_store")]
    pub store: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            store: default_session_store(),
        }
    }
}

fn default_session_store() -> PathBuf {
    PathBuf::from("sessions")
}

/// `commands` (spec.md §6): whether control commands are gated by access
/// groups in addition to the allowlist.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct CommandsConfig {
    #[serde(default)]
    pub use_access_groups: bool,
}

/// `agents.defaults` (spec.md §6).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentsConfig {
    #[serde(default)]
    pub defaults: AgentDefaults,
    /// Binding to the one agent this core dispatches every route to. The
    /// agent execution engine itself is out of scope (spec.md §1); this
    /// just names which external `agentCommand` process to invoke and
    /// under what id (spec.md §4.5 `Route.agentId`).
    #[serde(default)]
    pub process: AgentProcessConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentDefaults {
    /// IANA timezone name. When set, inbound messages are prefixed with
    /// `[Weekday YYYY-MM-DD HH:mm TZ]` (spec.md §6).
    #[serde(default)]
    pub user_timezone: Option<String>,
}

/// `agents.process` (spec.md §6 `agentCommand`): the external command this
/// gateway shells out to for every dispatch, following the teacher's
/// `AcpAgentConfig` shape (`command`, `args`, `env`) for spawning its ACP
/// agent subprocess.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentProcessConfig {
    #[serde(default = "default_agent_id")]
    pub agent_id: AgentId,
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for AgentProcessConfig {
    fn default() -> Self {
        Self {
            agent_id: default_agent_id(),
            command: default_agent_command(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

fn default_agent_id() -> AgentId {
    AgentId::from("main")
}

fn default_agent_command() -> String {
    "env:GATEWAY_AGENT_COMMAND".to_string()
}

/// Live configuration handle. Cheap to clone (an `Arc` around the
/// hot-reloadable parts); share one instance across the process.
#[derive(Clone)]
pub struct Config {
    data_dir: PathBuf,
    config_path: PathBuf,
    channels: Arc<ArcSwap<HashMap<String, ChannelBaseConfig>>>,
    commands: Arc<ArcSwap<CommandsConfig>>,
    session: SessionConfig,
    agents: AgentsConfig,
}

impl Config {
    /// Load from the default data directory's `gateway.toml`, overlaid with
    /// `GATEWAY__`-prefixed environment variables.
    pub fn load() -> Result<Self> {
        let data_dir = dirs::data_dir()
            .map(|d| d.join("gateway"))
            .unwrap_or_else(|| PathBuf::from("./data"));
        std::fs::create_dir_all(&data_dir).map_err(|e| {
            ConfigError::Load {
                path: data_dir.display().to_string(),
                message: e.to_string(),
            }
        })?;

        Self::load_from_path(&data_dir.join("gateway.toml"))
    }

    /// Load from an explicit TOML file path (the file need not exist; a
    /// missing file just means defaults plus environment overlay apply).
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let data_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let document = Self::read_document(path)?;
        Ok(Self::build(document, data_dir, path.to_path_buf()))
    }

    fn read_document(path: &Path) -> Result<ConfigDocument> {
        let built = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(config::Environment::with_prefix("GATEWAY").separator("__"))
            .build()
            .map_err(|e| ConfigError::Load {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        built
            .try_deserialize::<ConfigDocument>()
            .map_err(|e| ConfigError::Invalid(e.to_string()).into())
    }

    fn build(document: ConfigDocument, data_dir: PathBuf, config_path: PathBuf) -> Self {
        let channels = document
            .channels
            .into_iter()
            .map(|(id, doc)| (id, ChannelBaseConfig::from(doc)))
            .collect::<HashMap<_, _>>();

        Self {
            data_dir,
            config_path,
            channels: Arc::new(ArcSwap::from_pointee(channels)),
            commands: Arc::new(ArcSwap::from_pointee(document.commands)),
            session: document.session,
            agents: document.agents,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn session_store_dir(&self) -> PathBuf {
        if self.session.store.is_absolute() {
            self.session.store.clone()
        } else {
            self.data_dir.join(&self.session.store)
        }
    }

    pub fn pairing_store_path(&self, channel: &str) -> PathBuf {
        self.data_dir
            .join("pairing")
            .join(format!("{channel}.json"))
    }

    /// Current config for one channel plugin, if configured.
    pub fn channel(&self, id: &str) -> Option<ChannelBaseConfig> {
        self.channels.load().get(id).cloned()
    }

    pub fn use_access_groups(&self) -> bool {
        self.commands.load().use_access_groups
    }

    pub fn user_timezone(&self) -> Option<chrono_tz::Tz> {
        self.agents
            .defaults
            .user_timezone
            .as_deref()
            .and_then(|tz| tz.parse().ok())
    }

    pub fn agent_process(&self) -> &AgentProcessConfig {
        &self.agents.process
    }

    /// Directory media attachments are fetched into (spec.md §4.7).
    pub fn media_dir(&self) -> PathBuf {
        self.data_dir.join("media")
    }

    /// Re-read the config file and environment, swapping in the new
    /// hot-reloadable values in place (spec.md §6 `config.patch`, applied
    /// locally rather than over an RPC since the control surface that would
    /// invoke it is out of scope here).
    pub fn reload(&self) -> Result<()> {
        let document = Self::read_document(&self.config_path)?;
        let channels = document
            .channels
            .into_iter()
            .map(|(id, doc)| (id, ChannelBaseConfig::from(doc)))
            .collect::<HashMap<_, _>>();

        self.channels.store(Arc::new(channels));
        self.commands.store(Arc::new(document.commands));
        info!(path = %self.config_path.display(), "configuration reloaded");
        Ok(())
    }

    /// Start watching the config file for changes, reloading on every
    /// write. The returned watcher must be kept alive for the duration the
    /// caller wants reloads to keep firing.
    pub fn watch(self: &Arc<Self>) -> Result<RecommendedWatcher> {
        let this = Arc::clone(self);
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            match event {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    if let Err(error) = this.reload() {
                        warn!(%error, "config reload failed, keeping previous values");
                    }
                }
                Ok(_) => {}
                Err(error) => warn!(%error, "config watcher error"),
            }
        })
        .map_err(|e| ConfigError::Invalid(format!("failed to start config watcher: {e}")))?;

        if self.config_path.exists() {
            watcher
                .watch(&self.config_path, RecursiveMode::NonRecursive)
                .map_err(|e| ConfigError::Invalid(format!("failed to watch config file: {e}")))?;
        }

        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_defaults_when_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(&dir.path().join("gateway.toml")).unwrap();

        assert!(config.channel("discord").is_none());
        assert!(!config.use_access_groups());
        assert!(config.user_timezone().is_none());
        assert_eq!(config.agent_process().agent_id.as_ref(), "main");
    }

    #[test]
    fn parses_agent_process_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(
            &path,
            r#"
[agents.process]
agent_id = "assistant"
command = "/usr/local/bin/my-agent"
args = ["--foo"]
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path).unwrap();
        let process = config.agent_process();
        assert_eq!(process.agent_id.as_ref(), "assistant");
        assert_eq!(process.command, "/usr/local/bin/my-agent");
        assert_eq!(process.args, vec!["--foo".to_string()]);
    }

    #[test]
    fn parses_channel_and_commands_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"
[commands]
use_access_groups = true

[agents.defaults]
user_timezone = "America/Los_Angeles"

[channels.discord]
enabled = true
dm_policy = "allowlist"
group_policy = "open"
allow_from = ["alice"]
"#
        )
        .unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert!(config.use_access_groups());
        assert!(config.user_timezone().is_some());

        let discord = config.channel("discord").expect("discord channel configured");
        assert!(discord.enabled);
        assert_eq!(discord.config.dm_policy, crate::DmPolicy::Allowlist);
        assert_eq!(discord.config.allow_from, vec!["alice".to_string()]);
    }

    #[test]
    fn reload_picks_up_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "[commands]\nuse_access_groups = false\n").unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert!(!config.use_access_groups());

        std::fs::write(&path, "[commands]\nuse_access_groups = true\n").unwrap();
        config.reload().unwrap();
        assert!(config.use_access_groups());
    }
}
