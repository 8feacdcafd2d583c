//! Triangulated verdicts gating node completion.
//!
//! Per node iteration the judge produces a [`Verdict`] through three stages,
//! cheapest first:
//!
//! 1. **Implicit CONTINUE** - the iteration made non-synthetic tool calls,
//!    so the model is clearly doing work: bypass the judge entirely, no
//!    rule or LLM cost.
//! 2. **Rule stage** - [`EvaluationRule`]s evaluated in descending priority;
//!    the first matching condition returns its action definitively.
//! 3. **LLM stage** - an LLM judge prompted with the node's success criteria
//!    returns `{action, confidence, feedback}`; the action stands when
//!    `confidence >= threshold`, otherwise the verdict is ESCALATE with a
//!    low-confidence reason.
//!
//! A node with neither rules nor a judge model accepts by default - the
//! event loop still verifies declared output keys before honoring an
//! ACCEPT, so zero-config graphs stay runnable without being able to skip
//! their contracts.

use crate::conversation::NodeConversation;
use crate::error::Result;
use crate::graph::{Condition, ConditionContext};
use crate::llm::{ChatMessage, CompletionModel, CompletionRequest};
use crate::state::ScopedState;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Default confidence threshold for the LLM stage.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// The judge's decision for one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    /// The node is done; verify outputs and complete.
    Accept,
    /// Feed the feedback back and iterate again.
    Retry,
    /// Hand off to a human.
    Escalate,
    /// Implicit: the model is progressing, keep going.
    Continue,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accept => "ACCEPT",
            Verdict::Retry => "RETRY",
            Verdict::Escalate => "ESCALATE",
            Verdict::Continue => "CONTINUE",
        }
    }
}

/// Actions a deterministic rule may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleAction {
    Accept,
    Retry,
    Escalate,
}

impl From<RuleAction> for Verdict {
    fn from(action: RuleAction) -> Self {
        match action {
            RuleAction::Accept => Verdict::Accept,
            RuleAction::Retry => Verdict::Retry,
            RuleAction::Escalate => Verdict::Escalate,
        }
    }
}

/// One deterministic evaluation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRule {
    pub id: String,
    pub condition: Condition,
    pub action: RuleAction,
    /// Rules are evaluated in descending priority.
    #[serde(default)]
    pub priority: i32,
}

impl EvaluationRule {
    pub fn new(id: impl Into<String>, condition: Condition, action: RuleAction) -> Self {
        Self {
            id: id.into(),
            condition,
            action,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Which stage produced the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeKind {
    Rule,
    Llm,
    Implicit,
}

impl JudgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JudgeKind::Rule => "rule",
            JudgeKind::Llm => "llm",
            JudgeKind::Implicit => "implicit",
        }
    }
}

/// A verdict plus its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeOutcome {
    pub verdict: Verdict,
    pub feedback: Option<String>,
    pub judge_type: JudgeKind,
    pub confidence: Option<f64>,
}

/// What the judge sees for one iteration.
pub struct JudgeContext<'a> {
    pub conversation: &'a NodeConversation,
    pub state: &'a ScopedState,
    pub success_criteria: Option<&'a str>,
    pub iteration: u32,
    /// True when the iteration's LLM turn called non-synthetic tools.
    pub made_tool_calls: bool,
}

/// The triangulated judge for one node.
#[derive(Clone)]
pub struct JudgeProtocol {
    rules: Vec<EvaluationRule>,
    model: Option<Arc<dyn CompletionModel>>,
    confidence_threshold: f64,
    principles: Option<String>,
}

impl Default for JudgeProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl JudgeProtocol {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            model: None,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            principles: None,
        }
    }

    pub fn with_rules(mut self, rules: Vec<EvaluationRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_model(mut self, model: Arc<dyn CompletionModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_principles(mut self, principles: impl Into<String>) -> Self {
        self.principles = Some(principles.into());
        self
    }

    /// Produce the verdict for one iteration.
    pub async fn evaluate(&self, ctx: &JudgeContext<'_>) -> Result<JudgeOutcome> {
        // Stage: implicit CONTINUE. Non-synthetic tool calls mean the model
        // is doing work; skip the rule and LLM stages entirely.
        if ctx.made_tool_calls {
            return Ok(JudgeOutcome {
                verdict: Verdict::Continue,
                feedback: None,
                judge_type: JudgeKind::Implicit,
                confidence: None,
            });
        }

        let last_assistant = ctx
            .conversation
            .last_assistant_contents(1)
            .first()
            .copied()
            .unwrap_or_default()
            .to_string();

        // Stage: deterministic rules, descending priority, declaration order
        // on ties. First match is definitive.
        let mut rules: Vec<&EvaluationRule> = self.rules.iter().collect();
        rules.sort_by_key(|r| std::cmp::Reverse(r.priority));
        let condition_ctx = ConditionContext {
            state: ctx.state,
            text: &last_assistant,
        };
        for rule in rules {
            if rule.condition.evaluate(&condition_ctx)? {
                return Ok(JudgeOutcome {
                    verdict: rule.action.into(),
                    feedback: Some(format!("rule '{}' matched", rule.id)),
                    judge_type: JudgeKind::Rule,
                    confidence: None,
                });
            }
        }

        // Stage: LLM judge.
        if let Some(model) = &self.model {
            return self.evaluate_with_model(model.as_ref(), ctx).await;
        }

        // No rule matched and no judge model configured: accept and let the
        // event loop's output-key verification hold the line.
        Ok(JudgeOutcome {
            verdict: Verdict::Accept,
            feedback: Some("no judge configured".to_string()),
            judge_type: JudgeKind::Implicit,
            confidence: None,
        })
    }

    async fn evaluate_with_model(
        &self,
        model: &dyn CompletionModel,
        ctx: &JudgeContext<'_>,
    ) -> Result<JudgeOutcome> {
        let mut system = String::from(
            "You are a strict completion judge for an autonomous agent node. \
             Decide whether the node's work is complete.\n\
             Respond with a single JSON object: \
             {\"action\": \"ACCEPT\"|\"RETRY\"|\"ESCALATE\", \
             \"confidence\": 0.0-1.0, \"feedback\": \"...\"}.",
        );
        if let Some(criteria) = ctx.success_criteria {
            system.push_str("\n\nSuccess criteria:\n");
            system.push_str(criteria);
        }
        if let Some(principles) = &self.principles {
            system.push_str("\n\nPrinciples:\n");
            system.push_str(principles);
        }

        let mut transcript = String::new();
        for turn in ctx.conversation.turns() {
            transcript.push_str(&format!("[{:?}] {}\n", turn.role, turn.content));
        }
        let user = format!(
            "Iteration {} of the node. Conversation so far:\n\n{}",
            ctx.iteration, transcript
        );

        let request = CompletionRequest::new(vec![
            ChatMessage::system(system),
            ChatMessage::user(user),
        ]);
        let turn = model.complete(request).await?;

        let Some(parsed) = parse_judge_response(&turn.text) else {
            return Ok(JudgeOutcome {
                verdict: Verdict::Escalate,
                feedback: Some(format!("unparseable judge response: {}", turn.text)),
                judge_type: JudgeKind::Llm,
                confidence: None,
            });
        };

        if parsed.confidence >= self.confidence_threshold {
            Ok(JudgeOutcome {
                verdict: parsed.action.into(),
                feedback: parsed.feedback,
                judge_type: JudgeKind::Llm,
                confidence: Some(parsed.confidence),
            })
        } else {
            Ok(JudgeOutcome {
                verdict: Verdict::Escalate,
                feedback: Some(format!(
                    "low confidence ({:.2} < {:.2})",
                    parsed.confidence, self.confidence_threshold
                )),
                judge_type: JudgeKind::Llm,
                confidence: Some(parsed.confidence),
            })
        }
    }
}

#[derive(Deserialize)]
struct JudgeResponse {
    action: RuleAction,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    feedback: Option<String>,
}

/// Extract the first JSON object from the judge's reply. Tolerates prose or
/// code fences around it.
fn parse_judge_response(text: &str) -> Option<JudgeResponse> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}
