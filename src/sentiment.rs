use std::sync::LazyLock;

use regex::Regex;

use crate::llm::{self, LanguageModel};
use crate::models::Sentiment;

const SYSTEM_PROMPT: &str = r#"You are a sentiment analyzer. Analyze the overall sentiment of the user's message(s) and respond with exactly one word: "positive", "neutral", or "negative".

Guidelines:
- positive: Happy, satisfied, grateful, excited, pleased, friendly, appreciative
- negative: Angry, frustrated, disappointed, upset, annoyed, complaining, hostile
- neutral: Informational, matter-of-fact, neither positive nor negative, unclear

Respond with only the sentiment word, nothing else."#;

static AGENT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(agent|assistant|ai|pat|bot):").expect("valid regex"));
static CALLER_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(user|caller|customer|human|client):").expect("valid regex"));
static LEADING_CLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,2}:\d{2}").expect("valid regex"));
static CLOCK_ONLY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\d{1,2}:\d{2}(:\d{2})?\s*(AM|PM)?$").expect("valid regex")
});

/// Classifies `text`. Never fails: empty input, model errors and unexpected
/// replies all come back as neutral.
pub async fn analyze(llm: &dyn LanguageModel, text: &str) -> Sentiment {
    if text.trim().is_empty() {
        return Sentiment::Neutral;
    }

    match llm::ask(llm, SYSTEM_PROMPT, text, 10, Some(0.0)).await {
        Ok(reply) => match reply.to_lowercase().as_str() {
            "positive" => Sentiment::Positive,
            "negative" => Sentiment::Negative,
            "neutral" => Sentiment::Neutral,
            other => {
                tracing::warn!(reply = %other, "Unexpected sentiment reply");
                Sentiment::Neutral
            }
        },
        Err(e) => {
            tracing::error!("Sentiment analysis failed: {e}");
            Sentiment::Neutral
        }
    }
}

/// Pulls the caller's side out of a labelled transcript.
///
/// Agent lines are dropped, caller labels are stripped, unlabelled lines are
/// kept as continuations, and bare clock stamps are skipped.
pub fn extract_caller_messages(transcript: &str) -> String {
    let mut caller = Vec::new();

    for line in transcript.lines() {
        let line = line.trim();
        if line.is_empty() || AGENT_LINE.is_match(line) {
            continue;
        }

        if CALLER_LINE.is_match(line) {
            let message = CALLER_LINE.replace(line, "");
            let message = message.trim();
            if !message.is_empty() {
                caller.push(message.to_string());
            }
        } else if (!line.contains(':') || LEADING_CLOCK.is_match(line)) && !CLOCK_ONLY.is_match(line)
        {
            caller.push(line.to_string());
        }
    }

    caller.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedModel;

    #[test]
    fn caller_lines_are_kept_agent_lines_dropped() {
        let transcript = "Agent: Hi, how can I help?\nCaller: My order never arrived\n\
                          Assistant: Sorry to hear that\nUser: Can you check?\n10:32 AM\n\
                          and it was a gift";
        assert_eq!(
            extract_caller_messages(transcript),
            "My order never arrived Can you check? and it was a gift"
        );
    }

    #[test]
    fn labels_are_case_insensitive() {
        assert_eq!(extract_caller_messages("CUSTOMER: hello\nBOT: hi"), "hello");
    }

    #[test]
    fn other_labelled_lines_are_ignored() {
        assert_eq!(extract_caller_messages("Note: internal\nclient: yes"), "yes");
    }

    #[tokio::test]
    async fn model_reply_is_normalized() {
        let llm = ScriptedModel::replying(" Negative\n");
        assert_eq!(analyze(&llm, "This is the third time!").await, Sentiment::Negative);
    }

    #[tokio::test]
    async fn failures_and_empty_input_are_neutral() {
        let failing = ScriptedModel::failing();
        assert_eq!(analyze(&failing, "great service").await, Sentiment::Neutral);

        let odd = ScriptedModel::replying("ecstatic");
        assert_eq!(analyze(&odd, "great service").await, Sentiment::Neutral);

        let never_called = ScriptedModel::failing();
        assert_eq!(analyze(&never_called, "   ").await, Sentiment::Neutral);
        assert_eq!(never_called.calls(), 0);
    }
}
