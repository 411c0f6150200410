//! Provider B: session CLI, `resume --last` unless reset, JSONL stdout.
//!
//! Each line is a JSON record; the final message is the last record shaped
//! `{"type": "item.completed", "item": {"type": "agent_message", "text": "..."}}`.

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
        args.push("resume".to_string());
        args.push("--last".to_string());
    }
    args.push("--model".to_string());
    args.push(model.to_string());
    if let Some(system_prompt) = system_prompt {
        args.push("--instructions".to_string());
        args.push(system_prompt.to_string());
    }
    args.push(prompt.to_string());
    ("provider-b".to_string(), args)
}

pub fn parse_output(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .filter_map(|record| {
            if record.get("type")?.as_str()? != "item.completed" {
                return None;
            }
            let item = record.get("item")?;
            if item.get("type")?.as_str()? != "agent_message" {
                return None;
            }
            item.get("text")?.as_str().map(|s| s.to_string())
        })
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_omits_resume_flags() {
        let agent = Agent {
            id: "b".into(),
            name: "B".to_string(),
            provider: crate::ProviderKind::ProviderB,
            model: "default".to_string(),
            working_directory: "/tmp".into(),
            system_prompt: None,
            prompt_file: None,
        };
        let (_, args) = command(&agent, "gpt-5", "hi", true, None);
        assert!(!args.contains(&"resume".to_string()));
    }

    #[test]
    fn system_prompt_is_passed_as_instructions() {
        let agent = Agent {
            id: "b".into(),
            name: "B".to_string(),
            provider: crate::ProviderKind::ProviderB,
            model: "default".to_string(),
            working_directory: "/tmp".into(),
            system_prompt: Some("be terse".to_string()),
            prompt_file: None,
        };
        let (_, args) = command(&agent, "gpt-5", "hi", false, Some("be terse"));
        assert!(args.contains(&"--instructions".to_string()));
        assert!(args.contains(&"be terse".to_string()));
    }

    #[test]
    fn extracts_last_agent_message_record() {
        let stdout = concat!(
            r#"{"type":"item.started","item":{"type":"agent_message"}}"#,
            "\n",
            r#"{"type":"item.completed","item":{"type":"reasoning","text":"thinking"}}"#,
            "\n",
            r#"{"type":"item.completed","item":{"type":"agent_message","text":"hello there"}}"#,
        );
        assert_eq!(parse_output(stdout), Some("hello there".to_string()));
    }

    #[test]
    fn ignores_malformed_lines() {
        let stdout = "not json\n{\"type\":\"item.completed\",\"item\":{\"type\":\"agent_message\",\"text\":\"ok\"}}";
        assert_eq!(parse_output(stdout), Some("ok".to_string()));
    }
}
