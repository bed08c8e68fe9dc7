use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18620;
pub const DEFAULT_BIND: &str = "0.0.0.0";

/// How a channel participates in startup registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    /// Register iff all required environment variables are present.
    #[default]
    Auto,
    /// Must register; missing variables abort startup.
    Enabled,
    /// Never register, even when fully configured.
    Disabled,
}

/// Top-level config (porter.toml + PORTER_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PorterConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub pools: PoolsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// Agent runtime invocation parameters.
///
/// `auth_token` / `base_url` are forwarded to the runtime process
/// environment; `small_file_threshold_kb` and `faq_max_entries` are
/// interpolated into the assistant prompt at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_command")]
    pub command: String,
    pub auth_token: Option<String>,
    pub base_url: Option<String>,
    #[serde(default = "default_kb_root")]
    pub kb_root: String,
    #[serde(default = "default_small_file_kb")]
    pub small_file_threshold_kb: u64,
    #[serde(default = "default_faq_max_entries")]
    pub faq_max_entries: u32,
    /// Tool whitelist passed to the runtime. Empty = runtime default set.
    #[serde(default = "default_allowed_tools")]
    pub allowed_tools: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            auth_token: None,
            base_url: None,
            kb_root: default_kb_root(),
            small_file_threshold_kb: default_small_file_kb(),
            faq_max_entries: default_faq_max_entries(),
            allowed_tools: default_allowed_tools(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolsConfig {
    /// Concurrency budget for user-facing turns.
    #[serde(default = "default_user_pool")]
    pub user_size: usize,
    /// Concurrency budget for routing decisions (kept separate so a burst
    /// of routing calls cannot starve user turns).
    #[serde(default = "default_router_pool")]
    pub router_size: usize,
    /// Maximum seconds to wait for a free slot before failing the turn.
    #[serde(default = "default_pool_wait")]
    pub max_wait_secs: u64,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            user_size: default_user_pool(),
            router_size: default_router_pool(),
            max_wait_secs: default_pool_wait(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the sqlite database file. Empty string = in-process memory
    /// backend only (no cross-restart durability).
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Busy timeout handed to sqlite, bounding waits on the database
    /// file lock.
    #[serde(default = "default_file_lock_timeout")]
    pub file_lock_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            file_lock_timeout_ms: default_file_lock_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// `standalone` (HTTP chat API only) or a single channel tag
    /// (e.g. `workchat`). Modes are mutually exclusive.
    #[serde(default = "default_run_mode")]
    pub run_mode: String,
    #[serde(default)]
    pub workchat: ChannelMode,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            run_mode: default_run_mode(),
            workchat: ChannelMode::Auto,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Absolute TTL for the expert-mediation state machine.
    #[serde(default = "default_conv_state_ttl")]
    pub state_ttl_secs: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            state_ttl_secs: default_conv_state_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_dir")]
    pub dir: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dir: default_audit_dir(),
        }
    }
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_agent_command() -> String {
    "agentd".to_string()
}
fn default_kb_root() -> String {
    "./knowledge_base".to_string()
}
fn default_small_file_kb() -> u64 {
    64
}
fn default_faq_max_entries() -> u32 {
    200
}
fn default_allowed_tools() -> Vec<String> {
    ["Read", "Write", "Grep", "Glob", "Bash"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_user_pool() -> usize {
    5
}
fn default_router_pool() -> usize {
    3
}
fn default_pool_wait() -> u64 {
    30
}
fn default_db_path() -> String {
    "./porter.db".to_string()
}
fn default_file_lock_timeout() -> u64 {
    5_000
}
fn default_run_mode() -> String {
    "standalone".to_string()
}
fn default_conv_state_ttl() -> u64 {
    86_400
}
fn default_audit_dir() -> String {
    "./logs".to_string()
}

impl PorterConfig {
    /// Load config from a TOML file with PORTER_* env var overrides.
    ///
    /// A missing file is not an error; env vars and defaults still apply.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.unwrap_or("porter.toml");

        let config: PorterConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PORTER_").split("_"))
            .extract()
            .map_err(|e| crate::error::PorterError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Validate the run mode against the known channel tags.
    pub fn validate_run_mode(&self) -> crate::error::Result<()> {
        match self.channels.run_mode.as_str() {
            "standalone" | "workchat" | "webchat" => Ok(()),
            other => Err(crate::error::PorterError::Config(format!(
                "unknown run_mode '{other}' (expected standalone, workchat or webchat)"
            ))),
        }
    }
}
