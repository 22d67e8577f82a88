use serde_json::{Map, Value};

use crate::llm::{self, LanguageModel};

const SYSTEM_PROMPT: &str = r#"You are a PII redaction tool. Replace all personally identifiable information in the text with [REDACTED].

PII to redact:
- Personal names (first, last, full names)
- Phone numbers
- Email addresses
- Physical addresses (street, city, zip)
- Social Security Numbers
- Dates of birth
- Account numbers, credit card numbers
- Any other identifying information

Rules:
- Keep speaker labels intact (e.g. "Caller:", "Agent:", "Maggie:", etc.)
- Keep the conversation structure and formatting exactly the same
- Only replace the PII values, not surrounding text
- Do NOT add any explanation or commentary
- Return ONLY the redacted text"#;

/// Replaces PII in `text` with `[REDACTED]`. Fails open: on any model error
/// the original text is returned.
pub async fn redact(llm: &dyn LanguageModel, text: &str) -> String {
    if text.trim().is_empty() {
        return text.to_string();
    }

    let mut request = llm::CompletionRequest::new(vec![
        llm::Message::system(SYSTEM_PROMPT),
        llm::Message::user(text),
    ]);
    request.temperature = Some(0.0);

    match llm.complete(request).await {
        Ok(reply) if !reply.text().trim().is_empty() => reply.text().trim().to_string(),
        Ok(_) => {
            tracing::warn!("Empty PII redaction reply, keeping original");
            text.to_string()
        }
        Err(e) => {
            tracing::error!("PII redaction failed: {e}");
            text.to_string()
        }
    }
}

/// Redacts every string value of a JSON object. Numbers, booleans and nulls
/// are kept; nested arrays and objects are redacted as one JSON string and
/// parsed back when the model kept it valid.
pub async fn redact_object(llm: &dyn LanguageModel, data: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::with_capacity(data.len());
    for (key, value) in data {
        let redacted = match value {
            Value::String(s) => Value::String(redact(llm, s).await),
            Value::Bool(_) | Value::Number(_) | Value::Null => value.clone(),
            nested => {
                let text = redact(llm, &nested.to_string()).await;
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            }
        };
        out.insert(key.clone(), redacted);
    }
    out
}
