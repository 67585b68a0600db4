//! Tool Adapter (spec §4.4): filters/renames/guides tool definitions and
//! `tool_choice` hints across a dialect pair, and detects runaway
//! duplicate-tool-call loops.
//!
//! Rule tables are a `const &[ToolMappingRule]` slice keyed by
//! `(Dialect, Dialect)`, matching the regex-driven, data-table style of
//! `querymt-service`'s `transform_response` match arms.

use regex::Regex;
use serde_json::Value;

use crate::chat::ToolChoice;
use crate::dialect::{Dialect, GatewayRequest, Role};
use crate::gateway_error::GatewayError;

/// A tool name remap with an optional parameter-schema transform.
#[derive(Debug, Clone)]
pub struct MappedTool {
    pub from: &'static str,
    pub to: &'static str,
}

/// The filter/rename/guidance rules active for one `(source, target)`
/// dialect pair.
#[derive(Debug, Clone)]
pub struct ToolMappingRule {
    pub source: Dialect,
    pub target: Dialect,
    pub filtered_tools: &'static [&'static str],
    pub mapped_tools: &'static [MappedTool],
    pub guidance: &'static str,
}

/// The rule table. OpenAI's Responses-era local tools (`apply_patch`,
/// `update_plan`) have no Anthropic equivalent and are dropped with
/// guidance pointing at the closer analog; Anthropic's `bash`/`str_replace`
/// editor tools are remapped to a generic `shell`/`edit_file` pair when
/// routing the other way.
const RULES: &[ToolMappingRule] = &[
    ToolMappingRule {
        source: Dialect::OpenAiChat,
        target: Dialect::Anthropic,
        filtered_tools: &["apply_patch", "update_plan"],
        mapped_tools: &[],
        guidance: "The `apply_patch` and `update_plan` tools are not available on this \
            upstream; use `shell` to apply changes directly and narrate your plan in text \
            instead of a structured plan tool.",
    },
    ToolMappingRule {
        source: Dialect::Responses,
        target: Dialect::Anthropic,
        filtered_tools: &["apply_patch", "update_plan"],
        mapped_tools: &[],
        guidance: "The `apply_patch` and `update_plan` tools are not available on this \
            upstream; use `shell` to apply changes directly and narrate your plan in text \
            instead of a structured plan tool.",
    },
    ToolMappingRule {
        source: Dialect::Anthropic,
        target: Dialect::OpenAiChat,
        filtered_tools: &[],
        mapped_tools: &[
            MappedTool { from: "bash", to: "shell" },
            MappedTool { from: "str_replace_editor", to: "edit_file" },
        ],
        guidance: "",
    },
];

fn rule_for(source: Dialect, target: Dialect) -> Option<&'static ToolMappingRule> {
    RULES.iter().find(|r| r.source == source && r.target == target)
}

/// Adapts `req.tools`/`req.tool_choice`/system messages for the
/// `(source, target)` dialect pair, per the spec §4.4 algorithm. A no-op
/// when no rule is registered for the pair (e.g. translating within the
/// same dialect).
pub fn adapt_tools(req: &mut GatewayRequest, source: Dialect, target: Dialect) {
    let Some(rule) = rule_for(source, target) else { return };
    if req.tools.is_empty() && rule.filtered_tools.is_empty() && rule.mapped_tools.is_empty() {
        return;
    }

    let mut changed = false;
    let mut removed_names = Vec::new();

    req.tools.retain(|t| {
        if rule.filtered_tools.contains(&t.name.as_str()) {
            removed_names.push(t.name.clone());
            changed = true;
            false
        } else {
            true
        }
    });

    for t in req.tools.iter_mut() {
        if let Some(mapping) = rule.mapped_tools.iter().find(|m| m.from == t.name) {
            t.name = mapping.to.to_string();
            changed = true;
        }
    }

    if let Some(ToolChoice::Tool(name)) = &req.tool_choice {
        if removed_names.contains(name) {
            req.tool_choice = Some(ToolChoice::Auto);
            changed = true;
        }
    }

    if !removed_names.is_empty() {
        scrub_system_messages(req, &removed_names);
    }

    if changed && !rule.guidance.is_empty() {
        prepend_guidance(req, rule.guidance);
    }
}

/// Removes sentence-granularity mentions of filtered tool names from every
/// system message, so stale instructions ("use apply_patch to...") don't
/// survive translation.
fn scrub_system_messages(req: &mut GatewayRequest, removed_names: &[String]) {
    for name in removed_names {
        let Ok(sentence_re) = Regex::new(&format!(
            r"(?i)[^.!?\n]*\b{}\b[^.!?\n]*[.!?]?",
            regex::escape(name)
        )) else {
            continue;
        };
        for m in req.messages.iter_mut().filter(|m| m.role == Role::System) {
            if let crate::dialect::MessageContent::Text(text) = &mut m.content {
                let scrubbed = sentence_re.replace_all(text, "").to_string();
                *text = scrubbed.split_whitespace().collect::<Vec<_>>().join(" ");
            }
        }
    }
}

/// Prepends a consolidated guidance block to the first system message,
/// creating one if none exists.
fn prepend_guidance(req: &mut GatewayRequest, guidance: &str) {
    if let Some(sys) = req.messages.iter_mut().find(|m| m.role == Role::System) {
        if let crate::dialect::MessageContent::Text(text) = &mut sys.content {
            *text = format!("{guidance}\n\n{text}");
        }
    } else {
        req.messages.insert(0, crate::dialect::GatewayMessage::system(guidance));
    }
}

/// Canonicalizes tool-call arguments for loop-signature comparison:
/// reparses as JSON (so key order / whitespace don't matter) and falls
/// back to the raw trimmed string when the arguments aren't valid JSON.
pub fn canonical_arguments(raw: &str) -> String {
    match serde_json::from_str::<Value>(raw) {
        Ok(v) => serde_json::to_string(&v).unwrap_or_else(|_| raw.trim().to_string()),
        Err(_) => raw.trim().to_string(),
    }
}

/// Per-conversation duplicate-tool-call loop detector (spec §4.4). Lives
/// inline on the Responses session entry rather than a global map, since
/// the spec scopes it per-conversation.
#[derive(Debug, Clone, Default)]
pub struct ToolLoopDetector {
    last_signature: Option<(String, String)>,
    consecutive_count: u32,
}

/// The outcome of observing one tool call through the detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopVerdict {
    /// Forward the turn normally.
    Ok,
    /// Forward, but inject this warning text into the next system turn.
    Warn(&'static str),
    /// Refuse to forward; the caller should surface `GatewayError::InfiniteLoop`.
    Reject,
}

const WARNING_AT_3: &str = "WARNING: you have called this exact tool with these exact \
    arguments 3 times in a row. Try a different approach before repeating it again.";
const URGENT_AT_4: &str = "URGENT: this exact tool call has now repeated 4 times in a row \
    with no progress. The next identical call will be refused; change your approach now.";

impl ToolLoopDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observes one `(tool_name, arguments)` pair and returns the verdict
    /// for forwarding it. Thresholds: 3 -> warning, 4 -> urgent warning,
    /// 5 -> reject. Switching tool or arguments resets the counter to 1.
    pub fn observe(&mut self, tool_name: &str, raw_arguments: &str) -> LoopVerdict {
        let signature = (tool_name.to_string(), canonical_arguments(raw_arguments));
        if self.last_signature.as_ref() == Some(&signature) {
            self.consecutive_count += 1;
        } else {
            self.last_signature = Some(signature);
            self.consecutive_count = 1;
        }
        match self.consecutive_count {
            0..=2 => LoopVerdict::Ok,
            3 => LoopVerdict::Warn(WARNING_AT_3),
            4 => LoopVerdict::Warn(URGENT_AT_4),
            _ => LoopVerdict::Reject,
        }
    }

    pub fn consecutive_count(&self) -> u32 {
        self.consecutive_count
    }
}

pub fn loop_error(tool_name: &str) -> GatewayError {
    GatewayError::InfiniteLoop { tool_name: tool_name.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::Tool;
    use crate::dialect::{GatewayMessage, GatewayTool};

    fn tool(name: &str) -> GatewayTool {
        GatewayTool { name: name.to_string(), description: "d".into(), parameters: Value::Null, cache_control: None }
    }

    #[test]
    fn scenario_7_tool_filtering_and_choice_fallback_and_guidance() {
        let mut req = GatewayRequest {
            model: "claude-3-5-haiku-20241022".into(),
            messages: vec![],
            tools: vec![tool("apply_patch"), tool("shell")],
            tool_choice: Some(ToolChoice::Tool("apply_patch".into())),
            max_tokens: None,
            max_completion_tokens: None,
            temperature: None,
            stop: vec![],
            stream: false,
            reasoning_effort: None,
            thinking: None,
            parallel_tool_calls: None,
            user: None,
        };
        adapt_tools(&mut req, Dialect::Responses, Dialect::Anthropic);
        assert_eq!(req.tools.len(), 1);
        assert_eq!(req.tools[0].name, "shell");
        assert!(matches!(req.tool_choice, Some(ToolChoice::Auto)));
        let sys = req.messages.iter().find(|m| m.role == Role::System).unwrap();
        assert!(sys.content.as_text().contains("shell"));
    }

    #[test]
    fn mapped_tools_rename_without_filtering() {
        let mut req = GatewayRequest {
            model: "gpt-4o".into(),
            messages: vec![],
            tools: vec![tool("bash")],
            tool_choice: None,
            max_tokens: None,
            max_completion_tokens: None,
            temperature: None,
            stop: vec![],
            stream: false,
            reasoning_effort: None,
            thinking: None,
            parallel_tool_calls: None,
            user: None,
        };
        adapt_tools(&mut req, Dialect::Anthropic, Dialect::OpenAiChat);
        assert_eq!(req.tools[0].name, "shell");
    }

    #[test]
    fn scenario_6_duplicate_tool_emergency_stop() {
        let mut detector = ToolLoopDetector::new();
        let args = r#"{"cmd":"ls"}"#;
        assert_eq!(detector.observe("shell", args), LoopVerdict::Ok);
        assert_eq!(detector.observe("shell", args), LoopVerdict::Ok);
        assert!(matches!(detector.observe("shell", args), LoopVerdict::Warn(_)));
        assert!(matches!(detector.observe("shell", args), LoopVerdict::Warn(_)));
        assert_eq!(detector.observe("shell", args), LoopVerdict::Reject);
    }

    #[test]
    fn switching_tool_resets_counter() {
        let mut detector = ToolLoopDetector::new();
        let args = r#"{"cmd":"ls"}"#;
        detector.observe("shell", args);
        detector.observe("shell", args);
        detector.observe("shell", args);
        assert_eq!(detector.observe("read_file", r#"{"path":"a"}"#), LoopVerdict::Ok);
        assert_eq!(detector.consecutive_count(), 1);
    }

    #[test]
    fn canonical_arguments_ignores_key_order() {
        assert_eq!(
            canonical_arguments(r#"{"a":1,"b":2}"#),
            canonical_arguments(r#"{"b":2,"a":1}"#),
        );
    }
}
