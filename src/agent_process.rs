//! Process-backed Agent Runner (spec.md §1, §6).
//!
//! The LLM execution engine itself (`agentCommand`) is explicitly out of
//! scope for this core; this module is the one concrete seam the gateway
//! binary needs to actually run end to end. It shells out to an externally
//! configured command per dispatch, grounded in the teacher's
//! `AcpProcess::spawn` (`acp/process.rs`): piped stdin/stdout/stderr,
//! `kill_on_drop(true)`, a background stderr-capture task, and an
//! `env:VAR_NAME` indirection for the command string. The wire contract is
//! simpler than the teacher's full ACP JSON-RPC connection: one JSON
//! request line on stdin, newline-delimited `ReplyPayload` JSON on stdout.

use crate::config::AgentProcessConfig;
use crate::dispatch::{AgentRunner, DispatchRequest};
use crate::error::{DispatchError, Result};
use crate::ReplyPayload;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

const MAX_STDERR_BYTES: usize = 64 * 1024;

/// Request line written to the agent subprocess's stdin (spec.md §6
/// `agentCommand({message, agentId, sessionKey, idempotencyKey, label?,
/// spawnedBy?})`).
#[derive(Debug, Serialize)]
struct AgentCommandRequest<'a> {
    message: Option<&'a str>,
    agent_id: &'a str,
    session_key: &'a str,
    idempotency_key: Option<&'a str>,
    label: Option<&'a str>,
    spawned_by: Option<&'a str>,
}

/// Invokes a configured external command once per dispatch, feeding it the
/// request as one JSON line and reading the reply stream as
/// newline-delimited JSON payloads.
pub struct ProcessAgentRunner {
    command: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    working_dir: PathBuf,
}

impl ProcessAgentRunner {
    pub fn new(config: &AgentProcessConfig, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone().into_iter().collect(),
            working_dir: working_dir.into(),
        }
    }
}

#[async_trait]
impl AgentRunner for ProcessAgentRunner {
    async fn run(&self, request: &DispatchRequest) -> Result<BoxStream<'static, Result<ReplyPayload>>> {
        let command = resolve_command(&self.command)?;

        let mut cmd = tokio::process::Command::new(&command);
        cmd.args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            DispatchError::Other(anyhow::anyhow!("failed to spawn agent command {command}: {e}"))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DispatchError::Other(anyhow::anyhow!("agent process has no stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DispatchError::Other(anyhow::anyhow!("agent process has no stdout")))?;
        let stderr = child.stderr.take();

        let payload = AgentCommandRequest {
            message: request.message.as_deref(),
            agent_id: request.route.agent_id.as_ref(),
            session_key: request.route.session_key.as_str(),
            idempotency_key: request.idempotency_key.as_deref(),
            label: request.label.as_deref(),
            spawned_by: request.spawned_by.as_deref(),
        };
        let mut line = serde_json::to_vec(&payload)
            .map_err(|e| DispatchError::Other(anyhow::anyhow!("serialize agent request: {e}")))?;
        line.push(b'\n');
        stdin
            .write_all(&line)
            .await
            .map_err(|e| DispatchError::Other(anyhow::anyhow!("write agent request: {e}")))?;
        drop(stdin);

        let stderr_task = tokio::spawn(capture_stderr(stderr));

        let command_for_errors = command.clone();
        let lines = BufReader::new(stdout).lines();
        let stream = futures::stream::unfold(
            (lines, Some(child), Some(stderr_task), command_for_errors),
            move |(mut lines, mut child, mut stderr_task, command)| async move {
                match lines.next_line().await {
                    Ok(Some(raw)) => {
                        if raw.trim().is_empty() {
                            return Some((
                                Ok(None),
                                (lines, child, stderr_task, command),
                            ));
                        }
                        let parsed = serde_json::from_str::<ReplyPayload>(&raw)
                            .map_err(|e| {
                                DispatchError::StreamError(format!(
                                    "malformed agent payload: {e}"
                                ))
                                .into()
                            })
                            .map(Some);
                        Some((parsed, (lines, child, stderr_task, command)))
                    }
                    Ok(None) => {
                        if let Some(task) = stderr_task.take() {
                            let captured = task.await.unwrap_or_default();
                            if let Some(mut child) = child.take()
                                && let Ok(Some(status)) = child.try_wait()
                                && !status.success()
                            {
                                return Some((
                                    Err(DispatchError::StreamError(format!(
                                        "agent command {command} exited with {status}: {captured}"
                                    ))
                                    .into()),
                                    (lines, None, None, command),
                                ));
                            }
                        }
                        None
                    }
                    Err(e) => Some((
                        Err(DispatchError::StreamError(format!("read agent stdout: {e}")).into()),
                        (lines, child, stderr_task, command),
                    )),
                }
            },
        )
        .filter_map(|item| async move {
            match item {
                Ok(Some(payload)) => Some(Ok(payload)),
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            }
        });

        Ok(Box::pin(stream))
    }
}

async fn capture_stderr(stderr: Option<tokio::process::ChildStderr>) -> String {
    let Some(stderr) = stderr else {
        return String::new();
    };
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::with_capacity(4096);
    loop {
        let mut chunk = [0u8; 4096];
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let remaining = MAX_STDERR_BYTES.saturating_sub(buf.len());
                if remaining == 0 {
                    continue;
                }
                buf.extend_from_slice(&chunk[..n.min(remaining)]);
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Resolves a command string, following the teacher's `env:VAR_NAME`
/// indirection so the actual binary path never has to live in a committed
/// config file.
fn resolve_command(raw: &str) -> Result<String> {
    if let Some(var_name) = raw.strip_prefix("env:") {
        std::env::var(var_name).map_err(|_| {
            DispatchError::Other(anyhow::anyhow!(
                "agent command references env var '{var_name}' which is not set"
            ))
            .into()
        })
    } else if raw.is_empty() {
        Err(DispatchError::Other(anyhow::anyhow!("agent command is empty")).into())
    } else {
        Ok(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AccountId, AgentId, ChannelTag, ChatType, DeliveryContext, Route};
    use futures::StreamExt;

    fn route() -> Route {
        Route {
            agent_id: AgentId::from("main"),
            account_id: AccountId::from("default"),
            session_key: "k1".into(),
            main_session_key: "k1".into(),
        }
    }

    fn delivery() -> DeliveryContext {
        DeliveryContext {
            from: "u1".into(),
            to: "u1".into(),
            session_key: "k1".into(),
            account_id: AccountId::from("default"),
            chat_type: ChatType::Direct,
            conversation_label: None,
            sender_name: None,
            sender_id: "u1".into(),
            command_authorized: None,
            provider: None,
            surface: ChannelTag::from("mezon"),
            message_sid: None,
            media_path: None,
            media_type: None,
            media_url: None,
            originating_channel: ChannelTag::from("mezon"),
            originating_to: "u1".into(),
        }
    }

    #[test]
    fn resolve_command_reads_env_indirection() {
        unsafe {
            std::env::set_var("GATEWAY_TEST_AGENT_CMD", "/bin/echo");
        }
        assert_eq!(
            resolve_command("env:GATEWAY_TEST_AGENT_CMD").unwrap(),
            "/bin/echo"
        );
        unsafe {
            std::env::remove_var("GATEWAY_TEST_AGENT_CMD");
        }
    }

    #[test]
    fn resolve_command_errors_on_unset_env_var() {
        assert!(resolve_command("env:GATEWAY_TEST_AGENT_CMD_MISSING").is_err());
    }

    #[tokio::test]
    async fn runs_a_shell_echo_agent_and_streams_back_payloads() {
        // Uses `/bin/sh -c` to echo a single newline-delimited final
        // payload back, exercising the stdin-write/stdout-read contract
        // without depending on any real agent binary being installed.
        let reply = serde_json::json!({
            "text": "hi",
            "media_urls": [],
            "marker": "final",
            "error": false
        })
        .to_string();

        let runner = ProcessAgentRunner {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), format!("cat >/dev/null; echo '{reply}'")],
            env: Vec::new(),
            working_dir: std::env::temp_dir(),
        };

        let request = DispatchRequest {
            route: route(),
            delivery: delivery(),
            message: Some("hello".into()),
            idempotency_key: None,
            label: None,
            spawned_by: None,
        };

        let mut stream = runner.run(&request).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(first.is_final());
        assert_eq!(first.text.as_deref(), Some("hi"));
        assert!(stream.next().await.is_none());
    }
}
