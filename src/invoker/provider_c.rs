//! Provider C: alternate session CLI, JSON stdout. Selects the last record
//! shaped as a "text part", e.g. `{"type": "text", "text": "..."}`.

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
        args.push("--continue-session".to_string());
    }
    args.push("--model".to_string());
    args.push(model.to_string());
    if let Some(system_prompt) = system_prompt {
        args.push("--system".to_string());
        args.push(system_prompt.to_string());
    }
    args.push("--json".to_string());
    args.push(prompt.to_string());
    ("provider-c".to_string(), args)
}

pub fn parse_output(stdout: &str) -> Option<String> {
    let records: Vec<serde_json::Value> = stdout
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();

    let records = if records.is_empty() {
        serde_json::from_str::<serde_json::Value>(stdout)
            .ok()
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default()
    } else {
        records
    };

    records
        .into_iter()
        .filter(|record| record.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|record| record.get("text").and_then(|t| t.as_str()).map(|s| s.to_string()))
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_is_passed_as_system_flag() {
        let agent = Agent {
            id: "c".into(),
            name: "C".to_string(),
            provider: crate::ProviderKind::ProviderC,
            model: "default".to_string(),
            working_directory: "/tmp".into(),
            system_prompt: Some("be terse".to_string()),
            prompt_file: None,
        };
        let (_, args) = command(&agent, "gemini-2.5-pro", "hi", false, Some("be terse"));
        assert!(args.contains(&"--system".to_string()));
        assert!(args.contains(&"be terse".to_string()));
    }

    #[test]
    fn extracts_last_text_part() {
        let stdout = r#"[{"type":"tool_call","name":"ls"},{"type":"text","text":"partial"},{"type":"text","text":"final answer"}]"#;
        assert_eq!(parse_output(stdout), Some("final answer".to_string()));
    }

    #[test]
    fn handles_jsonl_form() {
        let stdout = "{\"type\":\"text\",\"text\":\"one\"}\n{\"type\":\"text\",\"text\":\"two\"}";
        assert_eq!(parse_output(stdout), Some("two".to_string()));
    }
}
