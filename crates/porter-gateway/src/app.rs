use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use porter_agent::{AgentInvocation, AgentRuntime, CliAgentRuntime, PoolRegistry};
use porter_audit::{AuditLogger, TracingAlertSink};
use porter_channels::{ChannelAdapter, ChannelRouter, WebChatAdapter};
use porter_core::config::{ChannelMode, PorterConfig};
use porter_identity::IdentityService;
use porter_orchestrator::{prompts, Orchestrator};
use porter_sessions::{AgentSessionStore, ConversationStateStore, SessionStore};
use porter_storage::{DegradableBackend, KvBackend, MemoryBackend, SqliteBackend};
use porter_workchat::WorkchatAdapter;

/// Central shared state, passed as `Arc<AppState>` to all handlers.
pub struct AppState {
    pub config: PorterConfig,
    pub orchestrator: Arc<Orchestrator>,
    pub channels: Arc<ChannelRouter>,
    pub webchat: Arc<WebChatAdapter>,
    pub sessions: Arc<SessionStore>,
    pub conv_state: Arc<ConversationStateStore>,
    pub pools: PoolRegistry,
}

impl AppState {
    /// Wire the whole service together in dependency order. The explicit
    /// startup sequence: storage → stores → identity/audit → pools →
    /// orchestrator → channels.
    pub async fn build(config: PorterConfig) -> anyhow::Result<Self> {
        let backend = open_backend(&config);

        let sessions = Arc::new(SessionStore::new(Arc::clone(&backend)));
        let agent_sessions = Arc::new(AgentSessionStore::new(Arc::clone(&backend)));
        let conv_channel = match config.channels.run_mode.as_str() {
            "standalone" => "webchat".to_string(),
            mode => mode.to_string(),
        };
        let conv_state = Arc::new(ConversationStateStore::new(
            Arc::clone(&backend),
            conv_channel,
            Duration::from_secs(config.conversation.state_ttl_secs),
        ));

        let kb_root = PathBuf::from(&config.agent.kb_root);
        let identity = Arc::new(IdentityService::new(&kb_root));
        let audit = Arc::new(AuditLogger::new(
            std::path::Path::new(&config.audit.dir),
            Box::new(TracingAlertSink),
        )?);

        let max_wait = Duration::from_secs(config.pools.max_wait_secs);
        let turn_runtime = Arc::new(CliAgentRuntime::new(
            AgentInvocation {
                command: config.agent.command.clone(),
                kb_root: kb_root.clone(),
                system_prompt: prompts::assistant_system_prompt(&config.agent),
                allowed_tools: config.agent.allowed_tools.clone(),
                auth_token: config.agent.auth_token.clone(),
                base_url: config.agent.base_url.clone(),
                resume: None,
            },
            config.pools.user_size,
            max_wait,
        ));
        // The routing judge answers from the candidate JSON alone.
        let router_runtime = Arc::new(CliAgentRuntime::new(
            AgentInvocation {
                command: config.agent.command.clone(),
                kb_root: kb_root.clone(),
                system_prompt: porter_agent::router::ROUTING_PROMPT.to_string(),
                allowed_tools: Vec::new(),
                auth_token: config.agent.auth_token.clone(),
                base_url: config.agent.base_url.clone(),
                resume: None,
            },
            config.pools.router_size,
            max_wait,
        ));

        let mut pools = PoolRegistry::new();
        pools.register("user", turn_runtime.pool());
        pools.register("router", router_runtime.pool());

        let orchestrator = Arc::new(Orchestrator::new(
            identity,
            Arc::clone(&sessions),
            agent_sessions,
            Arc::clone(&conv_state),
            turn_runtime as Arc<dyn AgentRuntime>,
            router_runtime as Arc<dyn AgentRuntime>,
            audit,
        ));

        let webchat = Arc::new(WebChatAdapter::new());
        let mut channels = ChannelRouter::new();
        // The web channel backs /api/chat and is always available.
        channels
            .register(
                Arc::clone(&webchat) as Arc<dyn ChannelAdapter>,
                ChannelMode::Auto,
            )
            .await?;

        if config.channels.run_mode == "workchat" {
            if config.channels.workchat == ChannelMode::Disabled {
                anyhow::bail!("run_mode is 'workchat' but the workchat channel is disabled");
            }
            // Mandatory in this run mode: missing credentials abort
            // startup with the list of absent variables.
            channels
                .register(Arc::new(WorkchatAdapter::new()), ChannelMode::Enabled)
                .await?;
        }

        info!(
            active_channels = ?channels.active_channels(),
            degraded = sessions.is_degraded(),
            "porter state assembled"
        );

        Ok(Self {
            config,
            orchestrator,
            channels: Arc::new(channels),
            webchat,
            sessions,
            conv_state,
            pools,
        })
    }
}

/// Hourly prune of rows whose lazy TTL has already passed.
const STORAGE_SWEEP_INTERVAL: Duration = Duration::from_secs(3_600);

fn open_backend(config: &PorterConfig) -> Arc<dyn KvBackend> {
    if config.storage.path.is_empty() {
        info!("no storage path configured, using in-process backend");
        return Arc::new(MemoryBackend::new());
    }
    match SqliteBackend::open(&config.storage.path, config.storage.file_lock_timeout_ms) {
        Ok(sqlite) => {
            let sqlite = Arc::new(sqlite);
            spawn_storage_sweep(Arc::clone(&sqlite));
            Arc::new(DegradableBackend::new(sqlite))
        }
        Err(e) => {
            // Start degraded rather than refuse to serve.
            warn!(path = %config.storage.path, error = %e, "sqlite unavailable, using in-process backend");
            Arc::new(MemoryBackend::new())
        }
    }
}

/// Expired records are already invisible to reads; this just reclaims the
/// rows behind them.
fn spawn_storage_sweep(sqlite: Arc<SqliteBackend>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STORAGE_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match sqlite.sweep_expired() {
                Ok(0) => {}
                Ok(removed) => info!(removed, "storage sweep pruned expired rows"),
                Err(e) => warn!(error = %e, "storage sweep failed"),
            }
        }
    });
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/api/stats", get(crate::http::stats::stats_handler))
        .route("/api/chat", post(crate::http::chat::chat_handler))
        .route(
            "/api/callback/{channel}",
            get(crate::http::callback::verify_handler).post(crate::http::callback::receive_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
