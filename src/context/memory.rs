//! Per-contact conversation memory: what the agent remembers about a phone
//! number, similar conversations with other contacts, and the update run
//! after every exchange.

use chrono::Utc;

use crate::contacts::to_e164;
use crate::llm::{self, LanguageModel};
use crate::models::{AgentConfig, Contact, ConversationContext};
use crate::store::{SimilarMemoryQuery, Store, StoreError};

const MAX_TOPICS: usize = 10;
const TOPICS_SHOWN_PER_MATCH: usize = 5;

const SUMMARY_SYSTEM: &str = "You write short, factual relationship summaries of customer conversations.";
const TOPICS_SYSTEM: &str = "You extract conversation topics and answer with a JSON array of strings only.";

/// One inbound text and the agent's reply.
#[derive(Debug, Clone, Copy)]
pub struct Exchange<'a> {
    pub contact_phone: &'a str,
    pub service_number: &'a str,
    pub inbound: &'a str,
    pub reply: &'a str,
}

fn plural(count: u32, word: &str) -> String {
    if count == 1 {
        format!("{count} {word}")
    } else {
        format!("{count} {word}s")
    }
}

async fn contact_context(
    store: &dyn Store,
    user_id: &str,
    phone: &str,
    agent_id: &str,
) -> Result<Option<(Contact, ConversationContext)>, StoreError> {
    let Some(contact) = store.find_contact_by_phone(user_id, &to_e164(phone)).await? else {
        return Ok(None);
    };
    let ctx = store.find_context(&contact.id, Some(agent_id)).await?;
    Ok(ctx.map(|ctx| (contact, ctx)))
}

/// Renders a stored context as a prompt section. `None` when the number
/// has no prior interactions.
pub fn render_contact_memory(ctx: &ConversationContext) -> Option<String> {
    let calls = ctx.interaction_count;
    let texts = ctx.sms_interaction_count;
    let total = calls + texts;
    if total == 0 {
        return None;
    }

    let mut counts = Vec::new();
    if calls > 0 {
        counts.push(plural(calls, "call"));
    }
    if texts > 0 {
        counts.push(plural(texts, "text"));
    }

    let mut lines = vec![
        "CONTACT MEMORY:".to_string(),
        format!(
            "This phone number has interacted {total} time(s) before ({}).",
            counts.join(", ")
        ),
        "Note: multiple people may share the same number.".to_string(),
    ];
    if let Some(summary) = ctx.summary.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("Previous summary: {summary}"));
    }
    if !ctx.key_topics.is_empty() {
        lines.push(format!("Key topics: {}", ctx.key_topics.join(", ")));
    }
    lines.push("Use this context once you know who you're speaking with.".to_string());
    Some(lines.join("\n"))
}

/// What the agent remembers about `phone`.
pub async fn contact_memory(
    store: &dyn Store,
    user_id: &str,
    phone: &str,
    agent: &AgentConfig,
) -> Option<String> {
    match contact_context(store, user_id, phone, &agent.id).await {
        Ok(Some((contact, ctx))) => {
            let memory = render_contact_memory(&ctx)?;
            tracing::info!(
                contact = contact.name.as_deref().unwrap_or(phone),
                calls = ctx.interaction_count,
                texts = ctx.sms_interaction_count,
                "Contact memory loaded"
            );
            Some(memory)
        }
        Ok(None) => None,
        Err(e) => {
            tracing::error!(phone, "Failed to load contact memory: {e}");
            None
        }
    }
}

/// Memories of other contacts whose conversations resemble this one.
pub async fn similar_memories(
    store: &dyn Store,
    llm: &dyn LanguageModel,
    user_id: &str,
    phone: &str,
    agent: &AgentConfig,
) -> Option<String> {
    let (contact, ctx) = match contact_context(store, user_id, phone, &agent.id).await {
        Ok(Some(found)) => found,
        Ok(None) => return None,
        Err(e) => {
            tracing::error!(phone, "Failed to load context for semantic search: {e}");
            return None;
        }
    };
    let summary = ctx.summary.as_deref().filter(|s| !s.is_empty())?;

    let search_text = format!("{summary}\n\nTopics: {}", ctx.key_topics.join(", "));
    let embedding = match llm.embed(&search_text).await {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!("Could not embed memory for semantic search: {e}");
            return None;
        }
    };

    let config = agent.semantic_memory_config.clone().unwrap_or_default();
    let query = SimilarMemoryQuery {
        embedding: &embedding,
        agent_id: &agent.id,
        user_id,
        exclude_contact_id: &contact.id,
        threshold: config.similarity_threshold,
        limit: config.max_results,
    };
    let matches = match store.match_similar_memories(&query).await {
        Ok(m) if !m.is_empty() => m,
        Ok(_) => return None,
        Err(e) => {
            tracing::error!("Semantic memory search failed: {e}");
            return None;
        }
    };

    let ids: Vec<String> = matches.iter().map(|m| m.id.clone()).collect();
    if let Err(e) = store.increment_semantic_match_counts(&ids).await {
        tracing::warn!("Failed to increment semantic match counts: {e}");
    }

    let mut lines = vec![
        "SIMILAR PAST CONVERSATIONS".to_string(),
        "Other contacts have discussed similar topics:".to_string(),
    ];
    for (i, m) in matches.iter().enumerate() {
        let pct = (m.similarity * 100.0).round() as i64;
        lines.push(format!(
            "\n{}. {} ({pct}% similar):",
            i + 1,
            m.contact_name.as_deref().unwrap_or("A contact")
        ));
        if let Some(summary) = &m.summary {
            lines.push(format!("   Summary: {summary}"));
        }
        if !m.key_topics.is_empty() {
            let shown: Vec<&str> = m
                .key_topics
                .iter()
                .take(TOPICS_SHOWN_PER_MATCH)
                .map(String::as_str)
                .collect();
            lines.push(format!("   Topics: {}", shown.join(", ")));
        }
    }
    lines.push(
        "\nUse this context to identify patterns or common issues. Don't reference other contacts directly."
            .to_string(),
    );
    tracing::info!(count = matches.len(), "Similar memories found");
    Some(lines.join("\n"))
}

async fn extract_topics(llm: &dyn LanguageModel, exchange: &Exchange<'_>) -> Vec<String> {
    let prompt = format!(
        "Extract 1-3 key topics from this SMS exchange as a JSON array of short strings:\n\"{}\" → \"{}\"\nReturn ONLY a JSON array, e.g. [\"topic1\", \"topic2\"]",
        exchange.inbound, exchange.reply
    );
    match llm::ask(llm, TOPICS_SYSTEM, &prompt, 50, Some(0.3)).await {
        Ok(raw) => llm::parse_string_array(&raw).unwrap_or_else(|| {
            tracing::warn!(reply = %raw, "Topic reply was not a JSON array");
            Vec::new()
        }),
        Err(e) => {
            tracing::warn!("Topic extraction failed: {e}");
            Vec::new()
        }
    }
}

/// Appends new topics not already present, keeping at most ten.
pub fn merge_topics(existing: &[String], new: Vec<String>) -> Vec<String> {
    let mut merged = existing.to_vec();
    for topic in new {
        if !merged.contains(&topic) {
            merged.push(topic);
        }
    }
    merged.truncate(MAX_TOPICS);
    merged
}

async fn embed_memory(llm: &dyn LanguageModel, summary: &str, topics: &[String]) -> Option<Vec<f32>> {
    let text = format!("{summary}\n\nTopics: {}", topics.join(", "));
    match llm.embed(&text).await {
        Ok(e) => Some(e),
        Err(e) => {
            tracing::warn!("Failed to embed memory: {e}");
            None
        }
    }
}

/// Folds one exchange into the contact's memory, creating the contact and
/// the context on first contact.
pub async fn record_exchange(
    store: &dyn Store,
    llm: &dyn LanguageModel,
    user_id: &str,
    agent: &AgentConfig,
    exchange: Exchange<'_>,
) -> Result<(), StoreError> {
    let phone = to_e164(exchange.contact_phone);
    let contact = match store.find_contact_by_phone(user_id, &phone).await? {
        Some(c) => c,
        None => {
            store
                .insert_contact(&Contact {
                    user_id: user_id.to_string(),
                    phone_number: Some(phone.clone()),
                    name: Some("Unknown".into()),
                    first_name: Some("Unknown".into()),
                    ..Default::default()
                })
                .await?
        }
    };

    let fallback = format!(
        "Customer texted: \"{}\" → Agent replied: \"{}\"",
        exchange.inbound, exchange.reply
    );

    match store.find_context(&contact.id, Some(&agent.id)).await? {
        Some(mut ctx) => {
            let summary = match ctx.summary.as_deref().filter(|s| !s.is_empty()) {
                Some(old) => {
                    let prompt = format!(
                        "Merge these two relationship summaries into one concise paragraph (2-3 sentences max):\n\nPrevious summary: {old}\n\nNew SMS exchange: {fallback}\n\nKeep the most important information. Focus on the overall relationship and key needs."
                    );
                    llm::ask(llm, SUMMARY_SYSTEM, &prompt, 150, Some(0.3))
                        .await
                        .unwrap_or_else(|e| {
                            tracing::warn!("Summary merge failed, keeping the raw exchange: {e}");
                            fallback.clone()
                        })
                }
                None => fallback.clone(),
            };
            let topics = merge_topics(&ctx.key_topics, extract_topics(llm, &exchange).await);

            if agent.semantic_memory_enabled {
                if let Some(embedding) = embed_memory(llm, &summary, &topics).await {
                    ctx.embedding = Some(embedding);
                }
            }
            ctx.summary = Some(summary);
            ctx.key_topics = topics;
            ctx.sms_interaction_count += 1;
            ctx.last_updated = Some(Utc::now());
            store.update_context(&ctx).await?;
            tracing::info!(contact_id = %contact.id, texts = ctx.sms_interaction_count, "Contact memory updated");
        }
        None => {
            let prompt = format!(
                "Summarize this SMS exchange in 1-2 sentences:\nCustomer: \"{}\"\nAgent: \"{}\"",
                exchange.inbound, exchange.reply
            );
            let summary = llm::ask(llm, SUMMARY_SYSTEM, &prompt, 100, Some(0.3))
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!("Summary failed, keeping the raw exchange: {e}");
                    fallback.clone()
                });
            let topics = merge_topics(&[], extract_topics(llm, &exchange).await);
            let embedding = if agent.semantic_memory_enabled {
                embed_memory(llm, &summary, &topics).await
            } else {
                None
            };

            store
                .insert_context(&ConversationContext {
                    contact_id: contact.id.clone(),
                    agent_id: Some(agent.id.clone()),
                    user_id: user_id.to_string(),
                    contact_phone: Some(phone),
                    service_number: Some(exchange.service_number.to_string()),
                    summary: Some(summary),
                    key_topics: topics,
                    interaction_count: 0,
                    sms_interaction_count: 1,
                    embedding,
                    last_updated: Some(Utc::now()),
                    ..Default::default()
                })
                .await?;
            tracing::info!(contact_id = %contact.id, "Contact memory created");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SemanticMemoryConfig;
    use crate::store::memory::MemoryStore;
    use crate::testing::ScriptedModel;

    fn agent() -> AgentConfig {
        AgentConfig {
            id: "a1".into(),
            user_id: "u1".into(),
            memory_enabled: true,
            semantic_memory_enabled: true,
            ..Default::default()
        }
    }

    fn exchange<'a>(inbound: &'a str, reply: &'a str) -> Exchange<'a> {
        Exchange {
            contact_phone: "+14155550100",
            service_number: "+14155559999",
            inbound,
            reply,
        }
    }

    #[test]
    fn render_pluralizes_counts() {
        let ctx = ConversationContext {
            interaction_count: 1,
            sms_interaction_count: 3,
            summary: Some("Asked about invoices.".into()),
            key_topics: vec!["billing".into(), "refund".into()],
            ..Default::default()
        };
        let text = render_contact_memory(&ctx).unwrap();
        assert!(text.starts_with("CONTACT MEMORY:\n"));
        assert!(text.contains("interacted 4 time(s) before (1 call, 3 texts)."));
        assert!(text.contains("Previous summary: Asked about invoices."));
        assert!(text.contains("Key topics: billing, refund"));

        assert_eq!(render_contact_memory(&ConversationContext::default()), None);
    }

    #[test]
    fn topics_merge_uniquely_and_cap() {
        let existing: Vec<String> = (0..9).map(|i| format!("t{i}")).collect();
        let merged = merge_topics(&existing, vec!["t1".into(), "new".into(), "another".into()]);
        assert_eq!(merged.len(), 10);
        assert_eq!(merged[9], "new");
    }

    #[tokio::test]
    async fn repeated_exchanges_merge_into_one_context() {
        let store = MemoryStore::default();
        let llm = ScriptedModel::routed(
            vec![("conversation topics", r#"["billing", "invoice"]"#), ("relationship summaries", "Customer chasing an invoice.")],
            "",
        );
        let agent = agent();

        record_exchange(&store, &llm, "u1", &agent, exchange("Where is my invoice?", "Sending it now."))
            .await
            .unwrap();
        record_exchange(&store, &llm, "u1", &agent, exchange("Got it, thanks", "Anytime!"))
            .await
            .unwrap();

        let contexts = store.with(|t| t.contexts.clone()).await;
        assert_eq!(contexts.len(), 1);
        let ctx = &contexts[0];
        assert_eq!(ctx.sms_interaction_count, 2);
        assert_eq!(ctx.key_topics, vec!["billing".to_string(), "invoice".to_string()]);
        assert_eq!(ctx.summary.as_deref(), Some("Customer chasing an invoice."));
        assert_eq!(ctx.service_number.as_deref(), Some("+14155559999"));
        assert!(ctx.embedding.is_some());

        let contacts = store.list_contacts("u1").await.unwrap();
        assert_eq!(contacts.len(), 1, "unknown sender gets a contact");

        let memory = contact_memory(&store, "u1", "+14155550100", &agent).await.unwrap();
        assert!(memory.contains("(2 texts)"));
    }

    #[tokio::test]
    async fn failed_summary_keeps_the_raw_exchange() {
        let store = MemoryStore::default();
        let llm = ScriptedModel::failing();
        let mut agent = agent();
        agent.semantic_memory_enabled = false;

        record_exchange(&store, &llm, "u1", &agent, exchange("hi", "hello"))
            .await
            .unwrap();
        let ctx = store.with(|t| t.contexts[0].clone()).await;
        assert_eq!(
            ctx.summary.as_deref(),
            Some("Customer texted: \"hi\" → Agent replied: \"hello\"")
        );
        assert!(ctx.key_topics.is_empty());
        assert!(ctx.embedding.is_none());
    }

    #[tokio::test]
    async fn similar_memories_from_other_contacts() {
        let store = MemoryStore::default();
        store
            .with(|t| {
                t.contacts.push(Contact {
                    id: "k1".into(),
                    user_id: "u1".into(),
                    phone_number: Some("+14155550100".into()),
                    ..Default::default()
                });
                t.contacts.push(Contact {
                    id: "k2".into(),
                    user_id: "u1".into(),
                    name: Some("Lee".into()),
                    ..Default::default()
                });
                t.contexts.push(ConversationContext {
                    id: "c1".into(),
                    contact_id: "k1".into(),
                    agent_id: Some("a1".into()),
                    user_id: "u1".into(),
                    summary: Some("Billing dispute.".into()),
                    key_topics: vec!["billing".into()],
                    embedding: Some(vec![1.0, 0.0, 0.0]),
                    ..Default::default()
                });
                t.contexts.push(ConversationContext {
                    id: "c2".into(),
                    contact_id: "k2".into(),
                    agent_id: Some("a1".into()),
                    user_id: "u1".into(),
                    summary: Some("Wanted a refund.".into()),
                    key_topics: (1..=7).map(|i| format!("t{i}")).collect(),
                    embedding: Some(vec![1.0, 0.0, 0.0]),
                    ..Default::default()
                });
            })
            .await;
        let mut agent = agent();
        agent.semantic_memory_config = Some(SemanticMemoryConfig {
            max_results: 2,
            similarity_threshold: 0.9,
        });
        let llm = ScriptedModel::replying("");

        let text = similar_memories(&store, &llm, "u1", "+14155550100", &agent)
            .await
            .unwrap();
        assert!(text.starts_with("SIMILAR PAST CONVERSATIONS\n"));
        assert!(text.contains("\n1. Lee (100% similar):"));
        assert!(text.contains("   Topics: t1, t2, t3, t4, t5\n"));
        assert!(!text.contains("Billing dispute"), "own memory is excluded");

        let count = store
            .with(|t| t.contexts.iter().find(|c| c.id == "c2").map(|c| c.semantic_match_count))
            .await;
        assert_eq!(count, Some(1));
    }
}
