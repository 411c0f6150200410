//! Agent Invoker (§4.3): subprocess contracts for the three supported
//! provider shapes.

mod provider_a;
mod provider_b;
mod provider_c;

use crate::error::{InvokerError, Result};
use crate::{Agent, ProviderKind};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncReadExt;

/// Maximum bytes of stderr retained for error diagnostics.
const MAX_STDERR_BYTES: usize = 16 * 1024;

/// Everything the invoker needs to run one turn with an agent.
pub struct InvokeRequest<'a> {
    pub agent: &'a Agent,
    pub prompt: String,
    /// Whether to drop `--continue`/`resume --last` and start a fresh session.
    pub reset: bool,
}

/// Result of a single successful invocation.
#[derive(Debug, Clone)]
pub struct InvokeOutcome {
    pub text: String,
}

/// Invoke `request.agent`'s subprocess and return its response text.
///
/// Dispatches on [`ProviderKind`] to the provider-specific command line and
/// output parser (§4.3), after resolving the working directory and model
/// alias. A non-zero exit surfaces as [`InvokerError::NonZeroExit`] carrying
/// stderr (or a generic message if stderr was empty).
pub async fn invoke(request: InvokeRequest<'_>) -> Result<InvokeOutcome> {
    let agent = request.agent;
    let working_dir = resolve_working_dir(agent)?;

    let model = resolve_model_alias(agent.provider, &agent.model);
    let system_prompt = resolve_system_prompt(agent)?;

    let (program, args) = match agent.provider {
        ProviderKind::ProviderA => {
            provider_a::command(agent, &model, &request.prompt, request.reset, system_prompt.as_deref())
        }
        ProviderKind::ProviderB => {
            provider_b::command(agent, &model, &request.prompt, request.reset, system_prompt.as_deref())
        }
        ProviderKind::ProviderC => {
            provider_c::command(agent, &model, &request.prompt, request.reset, system_prompt.as_deref())
        }
    };

    let output = run_subprocess(agent.id.as_ref(), &program, &args, &working_dir).await?;

    let text = match agent.provider {
        ProviderKind::ProviderA => provider_a::parse_output(&output.stdout),
        ProviderKind::ProviderB => provider_b::parse_output(&output.stdout),
        ProviderKind::ProviderC => provider_c::parse_output(&output.stdout),
    };

    let text = text.ok_or_else(|| InvokerError::NoResponse {
        agent_id: agent.id.to_string(),
    })?;

    Ok(InvokeOutcome { text })
}

/// Absolute path used as-is; relative resolved against the agent's working
/// directory's parent (already resolved at config load); directory is
/// created on first use as a visible event.
fn resolve_working_dir(agent: &Agent) -> Result<PathBuf> {
    let dir = &agent.working_directory;
    if !dir.exists() {
        tracing::info!(agent_id = %agent.id, dir = %dir.display(), "creating agent working directory");
        std::fs::create_dir_all(dir)?;
    }
    Ok(dir.clone())
}

/// Resolve the agent's effective system prompt text: `system_prompt` takes
/// priority if set; otherwise `prompt_file` is read from disk; otherwise none.
fn resolve_system_prompt(agent: &Agent) -> Result<Option<String>> {
    if let Some(inline) = &agent.system_prompt {
        return Ok(Some(inline.clone()));
    }
    let Some(path) = &agent.prompt_file else {
        return Ok(None);
    };
    let text = std::fs::read_to_string(path).map_err(|source| InvokerError::PromptFile {
        agent_id: agent.id.to_string(),
        path: path.display().to_string(),
        source,
    })?;
    Ok(Some(text))
}

/// Per-provider alias to concrete model id. Unrecognized aliases pass through
/// verbatim, per §4.3.
fn resolve_model_alias(provider: ProviderKind, alias: &str) -> String {
    let table: &[(&str, &str)] = match provider {
        ProviderKind::ProviderA => &[
            ("sonnet", "claude-sonnet-4-5"),
            ("opus", "claude-opus-4-1"),
            ("haiku", "claude-haiku-4-5"),
        ],
        ProviderKind::ProviderB => &[("fast", "gpt-5-mini"), ("default", "gpt-5")],
        ProviderKind::ProviderC => &[("default", "gemini-2.5-pro"), ("flash", "gemini-2.5-flash")],
    };
    table
        .iter()
        .find(|(key, _)| *key == alias)
        .map(|(_, id)| id.to_string())
        .unwrap_or_else(|| alias.to_string())
}

struct SubprocessOutput {
    stdout: String,
}

async fn run_subprocess(
    agent_id: &str,
    program: &str,
    args: &[String],
    working_dir: &Path,
) -> Result<SubprocessOutput> {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| InvokerError::Spawn {
        agent_id: agent_id.to_string(),
        source,
    })?;

    let stdout_handle = child.stdout.take();
    let stderr_handle = child.stderr.take();

    let stdout_task = tokio::spawn(async move { read_capped(stdout_handle, usize::MAX).await });
    let stderr_task = tokio::spawn(async move { read_capped(stderr_handle, MAX_STDERR_BYTES).await });

    let status = child.wait().await.map_err(|source| InvokerError::Spawn {
        agent_id: agent_id.to_string(),
        source,
    })?;

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    if !status.success() {
        let code = status.code().unwrap_or(-1);
        let message = if stderr.trim().is_empty() {
            format!("exit code {code}")
        } else {
            stderr
        };
        return Err(InvokerError::NonZeroExit {
            agent_id: agent_id.to_string(),
            code,
            stderr: message,
        }
        .into());
    }

    Ok(SubprocessOutput { stdout })
}

async fn read_capped<R>(reader: Option<R>, cap: usize) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::with_capacity(4096);
    loop {
        let mut chunk = [0u8; 4096];
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let remaining = cap.saturating_sub(buf.len());
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecognized_model_alias_passes_through() {
        assert_eq!(resolve_model_alias(ProviderKind::ProviderA, "custom-model"), "custom-model");
    }

    #[test]
    fn known_alias_resolves_to_concrete_id() {
        assert_eq!(resolve_model_alias(ProviderKind::ProviderA, "sonnet"), "claude-sonnet-4-5");
    }

    #[test]
    fn inline_system_prompt_takes_priority_over_prompt_file() {
        let temp = tempfile::tempdir().unwrap();
        let prompt_file = temp.path().join("system.md");
        std::fs::write(&prompt_file, "from file").unwrap();

        let agent = Agent {
            id: "a".into(),
            name: "A".to_string(),
            provider: ProviderKind::ProviderA,
            model: "sonnet".to_string(),
            working_directory: temp.path().to_path_buf(),
            system_prompt: Some("inline prompt".to_string()),
            prompt_file: Some(prompt_file),
        };

        assert_eq!(resolve_system_prompt(&agent).unwrap(), Some("inline prompt".to_string()));
    }

    #[test]
    fn prompt_file_is_read_when_no_inline_prompt() {
        let temp = tempfile::tempdir().unwrap();
        let prompt_file = temp.path().join("system.md");
        std::fs::write(&prompt_file, "from file").unwrap();

        let agent = Agent {
            id: "a".into(),
            name: "A".to_string(),
            provider: ProviderKind::ProviderA,
            model: "sonnet".to_string(),
            working_directory: temp.path().to_path_buf(),
            system_prompt: None,
            prompt_file: Some(prompt_file),
        };

        assert_eq!(resolve_system_prompt(&agent).unwrap(), Some("from file".to_string()));
    }

    #[test]
    fn no_system_prompt_configured_resolves_to_none() {
        let agent = Agent {
            id: "a".into(),
            name: "A".to_string(),
            provider: ProviderKind::ProviderA,
            model: "sonnet".to_string(),
            working_directory: "/tmp".into(),
            system_prompt: None,
            prompt_file: None,
        };

        assert_eq!(resolve_system_prompt(&agent).unwrap(), None);
    }

    #[test]
    fn resolve_working_dir_creates_missing_directory() {
        let temp = tempfile::tempdir().unwrap();
        let working_directory = temp.path().join("coder");
        let agent = Agent {
            id: "coder".into(),
            name: "Coder".to_string(),
            provider: ProviderKind::ProviderA,
            model: "sonnet".to_string(),
            working_directory: working_directory.clone(),
            system_prompt: None,
            prompt_file: None,
        };

        assert!(!working_directory.exists());
        let resolved = resolve_working_dir(&agent).unwrap();
        assert_eq!(resolved, working_directory);
        assert!(working_directory.is_dir());
    }
}
