//! Hook Pipeline (§4.6): ordered incoming/outgoing text transforms loaded
//! once at startup. A failing transform is logged and skipped rather than
//! failing the message it's attached to.

use std::collections::HashMap;

/// Context visible to a transform alongside the text it's rewriting.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub channel: String,
    pub sender: String,
    pub message_id: String,
    pub original_text: String,
}

/// A single hook transform. `Hook` implementors must not block; the pipeline
/// itself has no timeout, per the Programmer-error tier of §7 (a misbehaving
/// hook is caught and skipped, not killed).
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    /// Rewrite `text`, optionally attaching metadata. Returning `Err` causes
    /// the pipeline to log and skip this transform, passing the input
    /// through unchanged.
    fn apply(
        &self,
        text: &str,
        context: &HookContext,
    ) -> anyhow::Result<(String, HashMap<String, serde_json::Value>)>;
}

/// An ordered, immutable list of hooks applied in sequence. Each transform
/// sees the prior transform's output; metadata merges right-biased.
#[derive(Clone, Default)]
pub struct HookPipeline {
    hooks: Vec<std::sync::Arc<dyn Hook>>,
}

impl HookPipeline {
    pub fn new(hooks: Vec<std::sync::Arc<dyn Hook>>) -> Self {
        Self { hooks }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Run every hook over `text`, chaining outputs and merging metadata.
    pub fn run(&self, text: &str, context: &HookContext) -> (String, HashMap<String, serde_json::Value>) {
        let mut current = text.to_string();
        let mut metadata = HashMap::new();

        for hook in &self.hooks {
            match hook.apply(&current, context) {
                Ok((next_text, next_metadata)) => {
                    current = next_text;
                    metadata.extend(next_metadata);
                }
                Err(error) => {
                    tracing::warn!(hook = hook.name(), %error, "hook failed, skipping");
                }
            }
        }

        (current, metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Uppercase;
    impl Hook for Uppercase {
        fn name(&self) -> &str {
            "uppercase"
        }
        fn apply(
            &self,
            text: &str,
            _context: &HookContext,
        ) -> anyhow::Result<(String, HashMap<String, serde_json::Value>)> {
            Ok((text.to_uppercase(), HashMap::new()))
        }
    }

    struct AlwaysFails;
    impl Hook for AlwaysFails {
        fn name(&self) -> &str {
            "always_fails"
        }
        fn apply(
            &self,
            _text: &str,
            _context: &HookContext,
        ) -> anyhow::Result<(String, HashMap<String, serde_json::Value>)> {
            anyhow::bail!("boom")
        }
    }

    fn context() -> HookContext {
        HookContext {
            channel: "telegram".to_string(),
            sender: "Alice".to_string(),
            message_id: "m1".to_string(),
            original_text: "hi".to_string(),
        }
    }

    #[test]
    fn chains_transforms_in_order() {
        let pipeline = HookPipeline::new(vec![Arc::new(Uppercase)]);
        let (text, _) = pipeline.run("hi", &context());
        assert_eq!(text, "HI");
    }

    #[test]
    fn failing_hook_is_skipped_not_fatal() {
        let pipeline = HookPipeline::new(vec![Arc::new(AlwaysFails), Arc::new(Uppercase)]);
        let (text, _) = pipeline.run("hi", &context());
        assert_eq!(text, "HI");
    }
}
