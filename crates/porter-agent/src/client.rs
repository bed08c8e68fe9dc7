use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

use porter_core::types::AgentSessionId;

use crate::error::{AgentError, Result};
use crate::pool::PoolableClient;
use crate::protocol::{parse_event, AgentEvent};

/// Everything needed to launch one agent-runtime process.
///
/// Cloned per borrow by the pool's client factory; `resume` is the only
/// field that varies between borrows.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    /// Runtime executable (e.g. `agentd`), resolved via PATH.
    pub command: String,
    /// Working directory for the process: the knowledge-base root the
    /// runtime reads and writes.
    pub kb_root: PathBuf,
    /// Role-specific system prompt, resolved once at startup.
    pub system_prompt: String,
    /// Tool whitelist. Empty = runtime default set.
    pub allowed_tools: Vec<String>,
    /// Bearer token forwarded as `AGENT_AUTH_TOKEN`.
    pub auth_token: Option<String>,
    /// Alternate API endpoint forwarded as `AGENT_BASE_URL`.
    pub base_url: Option<String>,
    /// Agent-side conversation to resume. `None` starts a fresh one.
    pub resume: Option<AgentSessionId>,
}

/// One streaming connection to the agent runtime.
///
/// Spawns the runtime CLI with `--output-format stream-json` and reads
/// NDJSON events from its stdout. The child is `kill_on_drop`, so dropping
/// a connected client (including on task cancellation) always reclaims the
/// process.
pub struct AgentClient {
    invocation: AgentInvocation,
    child: Option<Child>,
    lines: Option<Lines<BufReader<ChildStdout>>>,
    // Held open for the child's lifetime; the runtime reads the prompt
    // from this path.
    sys_prompt_file: Option<tempfile::NamedTempFile>,
}

impl AgentClient {
    pub fn new(invocation: AgentInvocation) -> Self {
        Self {
            invocation,
            child: None,
            lines: None,
            sys_prompt_file: None,
        }
    }

    pub fn resume_token(&self) -> Option<&AgentSessionId> {
        self.invocation.resume.as_ref()
    }

    /// Spawn and wire up the runtime process.
    pub async fn connect(&mut self) -> Result<()> {
        let sys_file = tempfile::Builder::new()
            .prefix("porter-sys-")
            .suffix(".txt")
            .tempfile()
            .map_err(|e| AgentError::Unavailable(format!("failed to create prompt file: {e}")))?;
        std::fs::write(sys_file.path(), &self.invocation.system_prompt)
            .map_err(|e| AgentError::Unavailable(format!("failed to write prompt file: {e}")))?;

        let mut cmd = Command::new(&self.invocation.command);
        cmd.arg("--output-format")
            .arg("stream-json")
            .arg("--system-prompt-file")
            .arg(sys_file.path())
            .current_dir(&self.invocation.kb_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref resume) = self.invocation.resume {
            cmd.arg("--resume").arg(resume.as_str());
        }
        for tool in &self.invocation.allowed_tools {
            cmd.arg("--allowed-tool").arg(tool);
        }
        if let Some(ref token) = self.invocation.auth_token {
            cmd.env("AGENT_AUTH_TOKEN", token);
        }
        if let Some(ref base_url) = self.invocation.base_url {
            cmd.env("AGENT_BASE_URL", base_url);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AgentError::Unavailable(format!(
                    "agent runtime not found at '{}'",
                    self.invocation.command
                ))
            } else {
                AgentError::Unavailable(format!("failed to spawn agent runtime: {e}"))
            }
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Unavailable("runtime stdout not captured".into()))?;

        debug!(
            command = %self.invocation.command,
            resume = ?self.invocation.resume,
            "agent runtime spawned"
        );

        self.lines = Some(BufReader::new(stdout).lines());
        self.child = Some(child);
        self.sys_prompt_file = Some(sys_file);
        Ok(())
    }

    /// Send the user message and close stdin so the runtime starts the turn.
    pub async fn query(&mut self, message: &str) -> Result<()> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| AgentError::Unavailable("client not connected".into()))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Unavailable("runtime stdin not captured".into()))?;
        stdin
            .write_all(message.as_bytes())
            .await
            .map_err(|e| AgentError::Unavailable(format!("failed to write to runtime: {e}")))?;
        drop(stdin);
        Ok(())
    }

    /// Next event from the stream, `None` at end of stream. Unknown event
    /// kinds are skipped here so callers only ever see assistant and
    /// result events.
    pub async fn next_event(&mut self) -> Result<Option<AgentEvent>> {
        let lines = self
            .lines
            .as_mut()
            .ok_or_else(|| AgentError::Unavailable("client not connected".into()))?;
        loop {
            match lines.next_line().await? {
                None => return Ok(None),
                Some(line) => match parse_event(&line)? {
                    Some(event) => return Ok(Some(event)),
                    None => continue,
                },
            }
        }
    }

    /// Tear the process down. Runs in the same task that connected; safe
    /// to call on an already-dead child.
    pub async fn disconnect(&mut self) {
        self.lines = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                // Normal when the process already exited on its own.
                debug!(error = %e, "runtime already stopped");
            }
            if let Err(e) = child.wait().await {
                warn!(error = %e, "failed to reap agent runtime");
            }
        }
        self.sys_prompt_file = None;
    }
}

#[async_trait]
impl PoolableClient for AgentClient {
    async fn connect(&mut self) -> Result<()> {
        AgentClient::connect(self).await
    }

    async fn disconnect(&mut self) {
        AgentClient::disconnect(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(command: &str) -> AgentInvocation {
        AgentInvocation {
            command: command.to_string(),
            kb_root: std::env::temp_dir(),
            system_prompt: "you are a test".into(),
            allowed_tools: vec![],
            auth_token: None,
            base_url: None,
            resume: None,
        }
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let mut client = AgentClient::new(invocation("definitely-not-a-real-binary"));
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, AgentError::Unavailable(_)));
    }

    /// A stub runtime that ignores its flags and echoes stdin, so feeding
    /// it wire lines exercises the full spawn/write/read path.
    fn stub_runtime(dir: &std::path::Path) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("stub-agentd");
        std::fs::write(&path, "#!/bin/sh\ncat\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn streams_events_from_a_stub_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = AgentClient::new(invocation(&stub_runtime(dir.path())));
        client.connect().await.unwrap();
        client
            .query(concat!(
                r#"{"type":"assistant","content":[{"type":"text","text":"hi"}]}"#,
                "\n",
                r#"{"type":"result","session_id":"agent-1","num_turns":1,"duration_ms":5,"is_error":false}"#,
                "\n",
            ))
            .await
            .unwrap();

        let first = client.next_event().await.unwrap().unwrap();
        assert!(matches!(first, AgentEvent::Assistant { .. }));
        let second = client.next_event().await.unwrap().unwrap();
        assert!(matches!(second, AgentEvent::Result(_)));
        assert!(client.next_event().await.unwrap().is_none());

        client.disconnect().await;
    }
}
