//! Prompt templates for the judge, evaluator and orchestrator phases.
//!
//! Candidate outputs are embedded inside XML-style tags; everything the
//! caller or a model supplied is escaped first so a candidate cannot close
//! its own tag and smuggle instructions into the prompt.

use crate::gateway::Message;

use super::types::{ContentFormat, GenerationConfig, ResultItem};

// =============================================================================
// Prompt instance
// =============================================================================

/// Rendered prompt ready for an adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptInstance {
    pub template_slug: &'static str,
    /// Built-in system text for this template, if any.
    pub system: Option<String>,
    /// Conversation turns after the system message.
    pub turns: Vec<Message>,
    /// Whether the template asks for a JSON object back.
    pub expects_json: bool,
}

impl PromptInstance {
    pub fn user(template_slug: &'static str, text: impl Into<String>) -> Self {
        Self {
            template_slug,
            system: None,
            turns: vec![Message::user(text)],
            expects_json: false,
        }
    }

    /// Messages for the wire; the caller's system instruction (when enabled)
    /// comes before the template's own.
    pub fn to_messages(&self, config: &GenerationConfig) -> Vec<Message> {
        let system_parts: Vec<&str> = config
            .system_instruction()
            .into_iter()
            .chain(self.system.as_deref())
            .collect();

        let mut messages = Vec::with_capacity(self.turns.len() + 1);
        if !system_parts.is_empty() {
            messages.push(Message::system(system_parts.join("\n\n")));
        }
        messages.extend(self.turns.iter().cloned());
        messages
    }

    pub fn response_format(&self) -> ContentFormat {
        if self.expects_json {
            ContentFormat::Json
        } else {
            ContentFormat::Markdown
        }
    }

    /// Stable hash of the rendered text, for traces.
    pub fn hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.template_slug.as_bytes());
        if let Some(system) = &self.system {
            hasher.update(system.as_bytes());
        }
        for turn in &self.turns {
            hasher.update(turn.role.as_str().as_bytes());
            hasher.update(turn.content.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// Escape XML special characters to prevent prompt injection via tag breaking.
pub fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

// =============================================================================
// Templates
// =============================================================================

pub const PRIMARY_SLUG: &str = "primary_v1";
pub const JUDGE_MULTI_SLUG: &str = "judge_multi_v1";
pub const JUDGE_SINGLE_SLUG: &str = "judge_single_v1";
pub const SYNTHESIS_SLUG: &str = "synthesis_v1";
pub const CONTINUATION_SLUG: &str = "continuation_v1";

pub const DEFAULT_SYNTHESIS_INSTRUCTION: &str =
    "Synthesize a single best answer to the original prompt and explain why it is better than the individual candidates.";

const JUDGE_MULTI_SYSTEM: &str = r#"You are a careful reviewer assessing answers written by several AI models to the same prompt. For EVERY candidate, estimate the risk that relying on its answer would mislead the user: factual errors, unsupported claims, unsafe advice, missing caveats, or failure to answer the question.

Return only valid JSON of the form:
{"assessments": [{"targetModelId": "<model id exactly as given>", "risk_score": <0-100>, "risk_label": "LOW"|"MEDIUM"|"HIGH", "failure_modes": ["..."], "evidence": ["..."], "notes": "..."}]}

Use one entry per candidate and copy each targetModelId verbatim. If a candidate has no answer because its model failed, return {"targetModelId": "<id>", "error": "<why it cannot be judged>"} for it instead of a score."#;

const JUDGE_SINGLE_SYSTEM: &str = r#"You are a senior reviewer. Several AI models answered the same prompt. Write one consolidated report in Markdown that compares the candidates together: where they agree, where they contradict each other, which claims look wrong or risky, and which answer (or combination) a user should trust. Be concrete and cite the candidates by model id."#;

const SYNTHESIS_SYSTEM: &str = r#"You are an expert synthesis agent. You receive several answers to the same prompt from different AI models. Produce one answer that is strictly better than any individual candidate: keep the strongest elements, resolve contradictions, and drop anything unsupported.

Return only valid JSON: {"finalAnswer": "<the synthesized answer, Markdown allowed>", "rationale": "<why this answer, which candidates it drew on>"}"#;

const CONTINUATION_SYSTEM: &str =
    "You are continuing a conversation about an answer you synthesized from several AI models. Answer the follow-up directly.";

/// Prompt for the primary phase: the caller's prompt, verbatim.
pub fn primary(prompt: &str) -> PromptInstance {
    PromptInstance::user(PRIMARY_SLUG, prompt)
}

/// Render the original prompt plus every candidate output.
///
/// Failed candidates are included with their error so judges still see them.
pub fn candidate_bundle(prompt: &str, outputs: &[ResultItem]) -> String {
    let mut bundle = format!(
        "<original_prompt>\n{}\n</original_prompt>\n\n<candidates count=\"{}\">\n",
        escape_xml_chars(prompt.trim()),
        outputs.len()
    );

    for item in outputs {
        let id = escape_xml_chars(&item.model_id);
        match (item.text(), &item.error) {
            (_, Some(error)) => bundle.push_str(&format!(
                "<candidate model_id=\"{id}\">\n<error>{}</error>\n</candidate>\n",
                escape_xml_chars(error)
            )),
            (Some(text), None) => bundle.push_str(&format!(
                "<candidate model_id=\"{id}\">\n{}\n</candidate>\n",
                escape_xml_chars(text.trim())
            )),
            (None, None) => bundle.push_str(&format!(
                "<candidate model_id=\"{id}\">\n<error>no output</error>\n</candidate>\n"
            )),
        }
    }

    bundle.push_str("</candidates>");
    bundle
}

pub fn judge_multi(prompt: &str, outputs: &[ResultItem]) -> PromptInstance {
    let ids: Vec<String> = outputs
        .iter()
        .map(|o| format!("\"{}\"", escape_xml_chars(&o.model_id)))
        .collect();
    let user = format!(
        "{}\n\nAssess every candidate. Valid targetModelId values: [{}].\njson:",
        candidate_bundle(prompt, outputs),
        ids.join(", ")
    );

    PromptInstance {
        template_slug: JUDGE_MULTI_SLUG,
        system: Some(JUDGE_MULTI_SYSTEM.to_string()),
        turns: vec![Message::user(user)],
        expects_json: true,
    }
}

pub fn judge_single(prompt: &str, outputs: &[ResultItem]) -> PromptInstance {
    PromptInstance {
        template_slug: JUDGE_SINGLE_SLUG,
        system: Some(JUDGE_SINGLE_SYSTEM.to_string()),
        turns: vec![Message::user(format!(
            "{}\n\nWrite the consolidated report.",
            candidate_bundle(prompt, outputs)
        ))],
        expects_json: false,
    }
}

pub fn synthesis(prompt: &str, outputs: &[ResultItem], instruction: Option<&str>) -> PromptInstance {
    let instruction = instruction
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SYNTHESIS_INSTRUCTION);

    PromptInstance {
        template_slug: SYNTHESIS_SLUG,
        system: Some(SYNTHESIS_SYSTEM.to_string()),
        turns: vec![Message::user(format!(
            "{}\n\n<instruction>\n{}\n</instruction>\n\njson:",
            candidate_bundle(prompt, outputs),
            escape_xml_chars(instruction)
        ))],
        expects_json: true,
    }
}

/// Follow-up turn on a synthesized thread.
pub fn continuation(thread: &[Message], message: &str) -> PromptInstance {
    let mut turns = thread.to_vec();
    turns.push(Message::user(message));
    PromptInstance {
        template_slug: CONTINUATION_SLUG,
        system: Some(CONTINUATION_SYSTEM.to_string()),
        turns,
        expects_json: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{Content, ItemKind};
    use crate::gateway::Role;

    fn outputs() -> Vec<ResultItem> {
        vec![
            ResultItem::success(ItemKind::ModelOutput, "m1", 3, Content::markdown("A <b>bold</b> claim")),
            ResultItem::failure(ItemKind::ModelOutput, "m2", 9, "timeout: 10ms"),
        ]
    }

    #[test]
    fn bundle_escapes_and_includes_failures() {
        let bundle = candidate_bundle("why?", &outputs());
        assert!(bundle.contains("A &lt;b&gt;bold&lt;/b&gt; claim"));
        assert!(bundle.contains("<candidate model_id=\"m2\">\n<error>timeout: 10ms</error>"));
        assert!(bundle.contains("count=\"2\""));
    }

    #[test]
    fn judge_prompt_lists_valid_targets_and_wants_json() {
        let p = judge_multi("why?", &outputs());
        assert!(p.expects_json);
        assert!(p.turns[0].content.contains(r#"["m1", "m2"]"#));
    }

    #[test]
    fn synthesis_uses_default_instruction_when_blank() {
        let p = synthesis("q", &outputs(), Some("   "));
        assert!(p.turns[0].content.contains("Synthesize a single best answer"));
        let custom = synthesis("q", &outputs(), Some("Prefer brevity"));
        assert!(custom.turns[0].content.contains("Prefer brevity"));
    }

    #[test]
    fn system_instruction_precedes_template_system() {
        let config = GenerationConfig {
            include_system_instruction: true,
            system_prompt: "Answer in French.".into(),
            ..Default::default()
        };
        let messages = judge_single("q", &outputs()).to_messages(&config);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.starts_with("Answer in French."));
        assert_eq!(messages.len(), 2);

        let plain = primary("hi").to_messages(&GenerationConfig::default());
        assert_eq!(plain, vec![Message::user("hi")]);
    }

    #[test]
    fn continuation_appends_user_turn() {
        let thread = vec![Message::user("q"), Message::assistant("a")];
        let p = continuation(&thread, "and then?");
        assert_eq!(p.turns.len(), 3);
        assert_eq!(p.turns[2], Message::user("and then?"));
    }

    #[test]
    fn hash_is_stable_and_content_sensitive() {
        assert_eq!(primary("x").hash(), primary("x").hash());
        assert_ne!(primary("x").hash(), primary("y").hash());
    }
}
