//! Provider A: conversational CLI, `--continue` unless reset, plain-text stdout.

use crate::Agent;

pub fn command(
    _agent: &Agent,
    model: &str,
    prompt: &str,
    reset: bool,
    system_prompt: Option<&str>,
) -> (String, Vec<String>) {
    let mut args = Vec::new();
    if !reset {
        args.push("--continue".to_string());
    }
    args.push("--model".to_string());
    args.push(model.to_string());
    if let Some(system_prompt) = system_prompt {
        args.push("--append-system-prompt".to_string());
        args.push(system_prompt.to_string());
    }
    args.push("--prompt".to_string());
    args.push(prompt.to_string());
    ("provider-a".to_string(), args)
}

/// stdout itself is the response text.
pub fn parse_output(stdout: &str) -> Option<String> {
    let text = stdout.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_drops_continue_flag() {
        let agent = Agent {
            id: "a".into(),
            name: "A".to_string(),
            provider: crate::ProviderKind::ProviderA,
            model: "sonnet".to_string(),
            working_directory: "/tmp".into(),
            system_prompt: None,
            prompt_file: None,
        };
        let (_, args) = command(&agent, "claude-sonnet-4-5", "hi", true, None);
        assert!(!args.contains(&"--continue".to_string()));

        let (_, args) = command(&agent, "claude-sonnet-4-5", "hi", false, None);
        assert!(args.contains(&"--continue".to_string()));
    }

    #[test]
    fn system_prompt_is_appended_as_a_flag() {
        let agent = Agent {
            id: "a".into(),
            name: "A".to_string(),
            provider: crate::ProviderKind::ProviderA,
            model: "sonnet".to_string(),
            working_directory: "/tmp".into(),
            system_prompt: Some("be terse".to_string()),
            prompt_file: None,
        };
        let (_, args) = command(&agent, "claude-sonnet-4-5", "hi", false, Some("be terse"));
        assert!(args.contains(&"--append-system-prompt".to_string()));
        assert!(args.contains(&"be terse".to_string()));
    }

    #[test]
    fn blank_stdout_yields_no_response() {
        assert_eq!(parse_output("   \n"), None);
    }
}
