use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use super::{cosine_similarity, CreditDeduction, SimilarMemoryQuery, Store, StoreError};
use crate::models::*;

/// A knowledge chunk with the source it belongs to and its embedding.
#[derive(Debug, Clone, Deserialize)]
pub struct StoredChunk {
    pub knowledge_source_id: String,
    pub content: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
}

/// All tables of the in-memory backend. Also the shape of a seed file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Tables {
    pub users: Vec<User>,
    /// Access token -> user id.
    pub tokens: HashMap<String, String>,
    pub service_numbers: Vec<ServiceNumber>,
    pub agents: Vec<AgentConfig>,
    pub contacts: Vec<Contact>,
    pub contexts: Vec<ConversationContext>,
    pub knowledge_chunks: Vec<StoredChunk>,
    pub knowledge_sources: Vec<KnowledgeSource>,
    pub sms: Vec<SmsMessage>,
    pub opt_outs: Vec<SmsOptOut>,
    pub canadian_area_codes: Vec<String>,
    pub scheduled_actions: Vec<ScheduledAction>,
    pub calls: Vec<CallRecord>,
    pub widgets: Vec<ChatWidget>,
    pub chat_sessions: Vec<ChatSession>,
    pub chat_messages: Vec<ChatMessage>,
    pub providers: Vec<IntegrationProvider>,
    pub integrations: Vec<UserIntegration>,
    pub mcp_servers: Vec<McpServer>,
    pub tool_logs: Vec<ToolLog>,
    pub email_configs: Vec<AgentEmailConfig>,
    pub emails: Vec<EmailMessage>,
    pub org_members: Vec<OrganizationMember>,
    pub audit_log: Vec<AuditLogEntry>,
    /// Amounts passed to `deduct_credits`, in call order.
    #[serde(skip)]
    pub deductions: Vec<(String, f64)>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn assign_id(id: &str) -> String {
    if id.is_empty() {
        new_id()
    } else {
        id.to_string()
    }
}

impl MemoryStore {
    pub fn new(tables: Tables) -> Self {
        Self {
            tables: Mutex::new(tables),
        }
    }

    /// Loads tables from a JSON seed file.
    pub fn from_seed_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let tables: Tables = serde_json::from_str(&contents)?;
        Ok(Self::new(tables))
    }

    /// Runs `f` with exclusive access to the tables.
    pub async fn with<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        let mut tables = self.tables.lock().await;
        f(&mut tables)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_user(&self, id: &str) -> Result<Option<User>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.users.iter().find(|u| u.id == id).cloned())
    }

    async fn user_id_for_token(&self, token: &str) -> Result<Option<String>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.tokens.get(token).cloned())
    }

    async fn deduct_credits(
        &self,
        user_id: &str,
        amount: f64,
        _description: &str,
        _reference_type: &str,
    ) -> Result<CreditDeduction, StoreError> {
        let mut t = self.tables.lock().await;
        t.deductions.push((user_id.to_string(), amount));
        let user = t
            .users
            .iter_mut()
            .find(|u| u.id == user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
        user.credits_balance -= amount;
        Ok(CreditDeduction {
            balance_after: user.credits_balance,
            needs_recharge: user.credits_balance < 1.0,
        })
    }

    async fn active_service_number(
        &self,
        phone: &str,
    ) -> Result<Option<ServiceNumber>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.service_numbers
            .iter()
            .find(|n| n.phone_number == phone && n.is_active)
            .cloned())
    }

    async fn first_service_number(
        &self,
        user_id: &str,
    ) -> Result<Option<ServiceNumber>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.service_numbers
            .iter()
            .filter(|n| n.user_id == user_id && n.is_active)
            .min_by_key(|n| n.created_at)
            .cloned())
    }

    async fn get_agent(&self, id: &str) -> Result<Option<AgentConfig>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.agents.iter().find(|a| a.id == id).cloned())
    }

    async fn default_agent(&self, user_id: &str) -> Result<Option<AgentConfig>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.agents
            .iter()
            .find(|a| a.user_id == user_id && a.is_default)
            .cloned())
    }

    async fn oldest_agent(&self, user_id: &str) -> Result<Option<AgentConfig>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.agents
            .iter()
            .filter(|a| a.user_id == user_id)
            .min_by_key(|a| a.created_at)
            .cloned())
    }

    async fn update_agent_prompt(&self, agent_id: &str, prompt: &str) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        let agent = t
            .agents
            .iter_mut()
            .find(|a| a.id == agent_id)
            .ok_or_else(|| StoreError::NotFound(format!("agent {agent_id}")))?;
        agent.system_prompt = Some(prompt.to_string());
        Ok(())
    }

    async fn list_contacts(&self, user_id: &str) -> Result<Vec<Contact>, StoreError> {
        let t = self.tables.lock().await;
        let mut contacts: Vec<Contact> = t
            .contacts
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        contacts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(contacts)
    }

    async fn find_contact_by_phone(
        &self,
        user_id: &str,
        phone: &str,
    ) -> Result<Option<Contact>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.contacts
            .iter()
            .find(|c| c.user_id == user_id && c.phone_number.as_deref() == Some(phone))
            .cloned())
    }

    async fn find_contact_by_email(
        &self,
        user_id: &str,
        email: &str,
    ) -> Result<Option<Contact>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.contacts
            .iter()
            .find(|c| {
                c.user_id == user_id
                    && c.email
                        .as_deref()
                        .is_some_and(|e| e.eq_ignore_ascii_case(email))
            })
            .cloned())
    }

    async fn insert_contact(&self, contact: &Contact) -> Result<Contact, StoreError> {
        let mut t = self.tables.lock().await;
        let mut row = contact.clone();
        row.id = assign_id(&row.id);
        t.contacts.push(row.clone());
        Ok(row)
    }

    async fn update_contact(&self, contact: &Contact) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        let row = t
            .contacts
            .iter_mut()
            .find(|c| c.id == contact.id)
            .ok_or_else(|| StoreError::NotFound(format!("contact {}", contact.id)))?;
        *row = contact.clone();
        Ok(())
    }

    async fn find_context(
        &self,
        contact_id: &str,
        agent_id: Option<&str>,
    ) -> Result<Option<ConversationContext>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.contexts
            .iter()
            .filter(|c| c.contact_id == contact_id && c.agent_id.as_deref() == agent_id)
            .max_by_key(|c| c.last_updated)
            .cloned())
    }

    async fn find_thread_context(
        &self,
        user_id: &str,
        contact_phone: &str,
        service_number: &str,
    ) -> Result<Option<ConversationContext>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.contexts
            .iter()
            .find(|c| {
                c.user_id == user_id
                    && c.contact_phone.as_deref() == Some(contact_phone)
                    && c.service_number.as_deref() == Some(service_number)
            })
            .cloned())
    }

    async fn insert_context(
        &self,
        ctx: &ConversationContext,
    ) -> Result<ConversationContext, StoreError> {
        let mut t = self.tables.lock().await;
        let mut row = ctx.clone();
        row.id = assign_id(&row.id);
        t.contexts.push(row.clone());
        Ok(row)
    }

    async fn update_context(&self, ctx: &ConversationContext) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        let row = t
            .contexts
            .iter_mut()
            .find(|c| c.id == ctx.id)
            .ok_or_else(|| StoreError::NotFound(format!("context {}", ctx.id)))?;
        *row = ctx.clone();
        Ok(())
    }

    async fn match_similar_memories(
        &self,
        query: &SimilarMemoryQuery<'_>,
    ) -> Result<Vec<SimilarMemory>, StoreError> {
        let t = self.tables.lock().await;
        let mut matches: Vec<SimilarMemory> = t
            .contexts
            .iter()
            .filter(|c| {
                c.user_id == query.user_id
                    && c.agent_id.as_deref() == Some(query.agent_id)
                    && c.contact_id != query.exclude_contact_id
            })
            .filter_map(|c| {
                let similarity = cosine_similarity(query.embedding, c.embedding.as_deref()?);
                if similarity < query.threshold {
                    return None;
                }
                let contact_name = t
                    .contacts
                    .iter()
                    .find(|k| k.id == c.contact_id)
                    .and_then(|k| k.name.clone());
                Some(SimilarMemory {
                    id: c.id.clone(),
                    contact_name,
                    summary: c.summary.clone(),
                    key_topics: c.key_topics.clone(),
                    similarity,
                })
            })
            .collect();
        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        matches.truncate(query.limit);
        Ok(matches)
    }

    async fn increment_semantic_match_counts(&self, ids: &[String]) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        for ctx in t.contexts.iter_mut().filter(|c| ids.contains(&c.id)) {
            ctx.semantic_match_count += 1;
        }
        Ok(())
    }

    async fn match_knowledge_chunks(
        &self,
        embedding: &[f32],
        source_ids: &[String],
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<KnowledgeChunk>, StoreError> {
        let t = self.tables.lock().await;
        let mut ranked: Vec<KnowledgeChunk> = t
            .knowledge_chunks
            .iter()
            .filter(|c| source_ids.contains(&c.knowledge_source_id))
            .map(|c| KnowledgeChunk {
                content: c.content.clone(),
                similarity: Some(cosine_similarity(embedding, &c.embedding)),
            })
            .filter(|c| c.similarity.unwrap_or(0.0) >= threshold)
            .collect();
        ranked.sort_by(|a, b| {
            b.similarity
                .unwrap_or(0.0)
                .total_cmp(&a.similarity.unwrap_or(0.0))
        });
        ranked.truncate(limit);
        Ok(ranked)
    }

    async fn knowledge_chunks(
        &self,
        source_ids: &[String],
        limit: usize,
    ) -> Result<Vec<KnowledgeChunk>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.knowledge_chunks
            .iter()
            .filter(|c| source_ids.contains(&c.knowledge_source_id))
            .take(limit)
            .map(|c| KnowledgeChunk {
                content: c.content.clone(),
                similarity: None,
            })
            .collect())
    }

    async fn insert_knowledge_source(
        &self,
        source: &KnowledgeSource,
    ) -> Result<KnowledgeSource, StoreError> {
        let mut t = self.tables.lock().await;
        let mut row = source.clone();
        row.id = assign_id(&row.id);
        t.knowledge_sources.push(row.clone());
        Ok(row)
    }

    async fn insert_sms(&self, msg: &SmsMessage) -> Result<SmsMessage, StoreError> {
        let mut t = self.tables.lock().await;
        let mut row = msg.clone();
        row.id = assign_id(&row.id);
        t.sms.push(row.clone());
        Ok(row)
    }

    async fn recent_sms(
        &self,
        user_id: &str,
        contact_phone: &str,
        limit: usize,
    ) -> Result<Vec<SmsMessage>, StoreError> {
        let t = self.tables.lock().await;
        let mut rows: Vec<SmsMessage> = t
            .sms
            .iter()
            .filter(|m| {
                m.user_id == user_id
                    && (m.sender_number == contact_phone || m.recipient_number == contact_phone)
            })
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps
        rows.sort_by(|a, b| b.sent_at.cmp(&a.sent_at));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn set_latest_sms_translation(
        &self,
        user_id: &str,
        sender: &str,
        recipient: &str,
        direction: Direction,
        translation: &str,
    ) -> Result<Option<String>, StoreError> {
        let mut t = self.tables.lock().await;
        let latest = t
            .sms
            .iter_mut()
            .rev()
            .filter(|m| {
                m.user_id == user_id
                    && m.sender_number == sender
                    && m.recipient_number == recipient
                    && m.direction == direction
            })
            .max_by_key(|m| m.sent_at);
        Ok(latest.map(|m| {
            m.translation = Some(translation.to_string());
            m.id.clone()
        }))
    }

    async fn opt_out_status(&self, phone: &str) -> Result<Option<SmsOptOut>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.opt_outs.iter().find(|o| o.phone_number == phone).cloned())
    }

    async fn upsert_opt_out(&self, row: &SmsOptOut) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        match t
            .opt_outs
            .iter_mut()
            .find(|o| o.phone_number == row.phone_number)
        {
            Some(existing) => {
                existing.status = row.status;
                existing.updated_at = row.updated_at;
                if row.opted_out_at.is_some() {
                    existing.opted_out_at = row.opted_out_at;
                }
                if row.opted_in_at.is_some() {
                    existing.opted_in_at = row.opted_in_at;
                }
            }
            None => t.opt_outs.push(row.clone()),
        }
        Ok(())
    }

    async fn canadian_area_codes(&self) -> Result<Vec<String>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.canadian_area_codes.clone())
    }

    async fn insert_scheduled_action(
        &self,
        action: &ScheduledAction,
    ) -> Result<ScheduledAction, StoreError> {
        let mut t = self.tables.lock().await;
        let mut row = action.clone();
        row.id = assign_id(&row.id);
        t.scheduled_actions.push(row.clone());
        Ok(row)
    }

    async fn find_call_by_sid(&self, sid: &str) -> Result<Option<CallRecord>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.calls
            .iter()
            .find(|c| c.vendor_call_id.as_deref() == Some(sid) || c.call_sid.as_deref() == Some(sid))
            .cloned())
    }

    async fn update_call(&self, call: &CallRecord) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        let row = t
            .calls
            .iter_mut()
            .find(|c| c.id == call.id)
            .ok_or_else(|| StoreError::NotFound(format!("call {}", call.id)))?;
        *row = call.clone();
        Ok(())
    }

    async fn active_widget(&self, widget_key: &str) -> Result<Option<ChatWidget>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.widgets
            .iter()
            .find(|w| w.widget_key == widget_key && w.is_active)
            .cloned())
    }

    async fn active_chat_session(
        &self,
        widget_id: &str,
        visitor_id: &str,
    ) -> Result<Option<ChatSession>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.chat_sessions
            .iter()
            .filter(|s| {
                s.widget_id == widget_id
                    && s.visitor_id == visitor_id
                    && s.status == SessionStatus::Active
            })
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn insert_chat_session(&self, session: &ChatSession) -> Result<ChatSession, StoreError> {
        let mut t = self.tables.lock().await;
        let mut row = session.clone();
        row.id = assign_id(&row.id);
        t.chat_sessions.push(row.clone());
        Ok(row)
    }

    async fn update_chat_session(&self, session: &ChatSession) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        let row = t
            .chat_sessions
            .iter_mut()
            .find(|s| s.id == session.id)
            .ok_or_else(|| StoreError::NotFound(format!("chat session {}", session.id)))?;
        *row = session.clone();
        Ok(())
    }

    async fn insert_chat_message(&self, msg: &ChatMessage) -> Result<ChatMessage, StoreError> {
        let mut t = self.tables.lock().await;
        let mut row = msg.clone();
        row.id = assign_id(&row.id);
        t.chat_messages.push(row.clone());
        Ok(row)
    }

    async fn chat_history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let t = self.tables.lock().await;
        let rows: Vec<ChatMessage> = t
            .chat_messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        let skip = rows.len().saturating_sub(limit);
        Ok(rows.into_iter().skip(skip).collect())
    }

    async fn integration(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<UserIntegration>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.integrations
            .iter()
            .find(|i| i.user_id == user_id && i.provider == provider && i.is_connected())
            .cloned())
    }

    async fn integration_by_id(&self, id: &str) -> Result<Option<UserIntegration>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.integrations.iter().find(|i| i.id == id).cloned())
    }

    async fn update_integration(&self, integration: &UserIntegration) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        let row = t
            .integrations
            .iter_mut()
            .find(|i| i.id == integration.id)
            .ok_or_else(|| StoreError::NotFound(format!("integration {}", integration.id)))?;
        *row = integration.clone();
        Ok(())
    }

    async fn integration_providers(&self) -> Result<Vec<IntegrationProvider>, StoreError> {
        let t = self.tables.lock().await;
        let mut providers: Vec<_> = t.providers.iter().filter(|p| p.enabled).cloned().collect();
        providers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(providers)
    }

    async fn user_integrations(&self, user_id: &str) -> Result<Vec<UserIntegration>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.integrations
            .iter()
            .filter(|i| i.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn mcp_servers(&self, user_id: &str) -> Result<Vec<McpServer>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.mcp_servers
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert_tool_log(&self, log: &ToolLog) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        t.tool_logs.push(log.clone());
        Ok(())
    }

    async fn email_configs_for(
        &self,
        gmail_address: &str,
    ) -> Result<Vec<AgentEmailConfig>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.email_configs
            .iter()
            .filter(|c| c.is_active && c.gmail_address.eq_ignore_ascii_case(gmail_address))
            .cloned()
            .collect())
    }

    async fn set_email_history_id(
        &self,
        config_id: &str,
        history_id: &str,
    ) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        let row = t
            .email_configs
            .iter_mut()
            .find(|c| c.id == config_id)
            .ok_or_else(|| StoreError::NotFound(format!("email config {config_id}")))?;
        row.last_history_id = Some(history_id.to_string());
        Ok(())
    }

    async fn email_message_exists(&self, gmail_message_id: &str) -> Result<bool, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.emails
            .iter()
            .any(|e| e.gmail_message_id == gmail_message_id))
    }

    async fn insert_email(&self, msg: &EmailMessage) -> Result<EmailMessage, StoreError> {
        let mut t = self.tables.lock().await;
        let mut row = msg.clone();
        row.id = assign_id(&row.id);
        t.emails.push(row.clone());
        Ok(row)
    }

    async fn set_email_draft(&self, gmail_message_id: &str, draft: &str) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        let row = t
            .emails
            .iter_mut()
            .find(|e| e.gmail_message_id == gmail_message_id)
            .ok_or_else(|| StoreError::NotFound(format!("email {gmail_message_id}")))?;
        row.ai_draft = Some(draft.to_string());
        row.ai_draft_status = Some("pending".to_string());
        Ok(())
    }

    async fn email_thread(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<EmailMessage>, StoreError> {
        let t = self.tables.lock().await;
        let mut rows: Vec<EmailMessage> = t
            .emails
            .iter()
            .filter(|e| e.thread_id == thread_id)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.sent_at);
        let skip = rows.len().saturating_sub(limit);
        Ok(rows.into_iter().skip(skip).collect())
    }

    async fn get_org_member(&self, id: &str) -> Result<Option<OrganizationMember>, StoreError> {
        let t = self.tables.lock().await;
        Ok(t.org_members.iter().find(|m| m.id == id).cloned())
    }

    async fn update_org_member(&self, member: &OrganizationMember) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        let row = t
            .org_members
            .iter_mut()
            .find(|m| m.id == member.id)
            .ok_or_else(|| StoreError::NotFound(format!("member {}", member.id)))?;
        *row = member.clone();
        Ok(())
    }

    async fn insert_audit_log(&self, entry: &AuditLogEntry) -> Result<(), StoreError> {
        let mut t = self.tables.lock().await;
        t.audit_log.push(entry.clone());
        Ok(())
    }
}
