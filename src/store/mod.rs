//! Persistence.
//!
//! One method per query the service performs. The PostgREST backend talks to
//! Supabase; the memory backend keeps tables in-process for local runs and
//! tests.

pub mod memory;
pub mod supabase;

use async_trait::async_trait;
use serde::Deserialize;

use crate::models::*;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("Store API error: {0}")]
    Api(String),
    #[error("Failed to decode rows: {0}")]
    Decode(String),
    #[error("Row not found: {0}")]
    NotFound(String),
}

/// Arguments of the `match_similar_memories` RPC.
#[derive(Debug, Clone)]
pub struct SimilarMemoryQuery<'a> {
    pub embedding: &'a [f32],
    pub agent_id: &'a str,
    pub user_id: &'a str,
    pub exclude_contact_id: &'a str,
    pub threshold: f32,
    pub limit: usize,
}

/// Result of the `deduct_credits` RPC.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CreditDeduction {
    pub balance_after: f64,
    #[serde(default)]
    pub needs_recharge: bool,
}

#[async_trait]
pub trait Store: Send + Sync {
    // Users and billing
    async fn get_user(&self, id: &str) -> Result<Option<User>, StoreError>;
    /// Resolves a user access token to a user id. `None` for unknown tokens.
    async fn user_id_for_token(&self, token: &str) -> Result<Option<String>, StoreError>;
    async fn deduct_credits(
        &self,
        user_id: &str,
        amount: f64,
        description: &str,
        reference_type: &str,
    ) -> Result<CreditDeduction, StoreError>;

    // Numbers and agents
    async fn active_service_number(&self, phone: &str)
        -> Result<Option<ServiceNumber>, StoreError>;
    async fn first_service_number(&self, user_id: &str)
        -> Result<Option<ServiceNumber>, StoreError>;
    async fn get_agent(&self, id: &str) -> Result<Option<AgentConfig>, StoreError>;
    async fn default_agent(&self, user_id: &str) -> Result<Option<AgentConfig>, StoreError>;
    async fn oldest_agent(&self, user_id: &str) -> Result<Option<AgentConfig>, StoreError>;
    async fn update_agent_prompt(&self, agent_id: &str, prompt: &str) -> Result<(), StoreError>;

    // Contacts
    async fn list_contacts(&self, user_id: &str) -> Result<Vec<Contact>, StoreError>;
    async fn find_contact_by_phone(
        &self,
        user_id: &str,
        phone: &str,
    ) -> Result<Option<Contact>, StoreError>;
    async fn find_contact_by_email(
        &self,
        user_id: &str,
        email: &str,
    ) -> Result<Option<Contact>, StoreError>;
    async fn insert_contact(&self, contact: &Contact) -> Result<Contact, StoreError>;
    async fn update_contact(&self, contact: &Contact) -> Result<(), StoreError>;

    // Conversation memory
    async fn find_context(
        &self,
        contact_id: &str,
        agent_id: Option<&str>,
    ) -> Result<Option<ConversationContext>, StoreError>;
    /// Context for a (user, contact phone, service number) thread.
    async fn find_thread_context(
        &self,
        user_id: &str,
        contact_phone: &str,
        service_number: &str,
    ) -> Result<Option<ConversationContext>, StoreError>;
    async fn insert_context(
        &self,
        ctx: &ConversationContext,
    ) -> Result<ConversationContext, StoreError>;
    async fn update_context(&self, ctx: &ConversationContext) -> Result<(), StoreError>;
    async fn match_similar_memories(
        &self,
        query: &SimilarMemoryQuery<'_>,
    ) -> Result<Vec<SimilarMemory>, StoreError>;
    async fn increment_semantic_match_counts(&self, ids: &[String]) -> Result<(), StoreError>;

    // Knowledge base
    async fn match_knowledge_chunks(
        &self,
        embedding: &[f32],
        source_ids: &[String],
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<KnowledgeChunk>, StoreError>;
    /// Unranked chunks, used when vector search is unavailable.
    async fn knowledge_chunks(
        &self,
        source_ids: &[String],
        limit: usize,
    ) -> Result<Vec<KnowledgeChunk>, StoreError>;
    async fn insert_knowledge_source(
        &self,
        source: &KnowledgeSource,
    ) -> Result<KnowledgeSource, StoreError>;

    // SMS
    async fn insert_sms(&self, msg: &SmsMessage) -> Result<SmsMessage, StoreError>;
    /// Messages exchanged with `contact_phone`, newest first.
    async fn recent_sms(
        &self,
        user_id: &str,
        contact_phone: &str,
        limit: usize,
    ) -> Result<Vec<SmsMessage>, StoreError>;
    /// Stores a translation on the newest message matching the route.
    async fn set_latest_sms_translation(
        &self,
        user_id: &str,
        sender: &str,
        recipient: &str,
        direction: Direction,
        translation: &str,
    ) -> Result<Option<String>, StoreError>;
    async fn opt_out_status(&self, phone: &str) -> Result<Option<SmsOptOut>, StoreError>;
    async fn upsert_opt_out(&self, row: &SmsOptOut) -> Result<(), StoreError>;
    async fn canadian_area_codes(&self) -> Result<Vec<String>, StoreError>;
    async fn insert_scheduled_action(
        &self,
        action: &ScheduledAction,
    ) -> Result<ScheduledAction, StoreError>;

    // Calls
    async fn find_call_by_sid(&self, sid: &str) -> Result<Option<CallRecord>, StoreError>;
    async fn update_call(&self, call: &CallRecord) -> Result<(), StoreError>;

    // Chat
    async fn active_widget(&self, widget_key: &str) -> Result<Option<ChatWidget>, StoreError>;
    async fn active_chat_session(
        &self,
        widget_id: &str,
        visitor_id: &str,
    ) -> Result<Option<ChatSession>, StoreError>;
    async fn insert_chat_session(&self, session: &ChatSession) -> Result<ChatSession, StoreError>;
    async fn update_chat_session(&self, session: &ChatSession) -> Result<(), StoreError>;
    async fn insert_chat_message(&self, msg: &ChatMessage) -> Result<ChatMessage, StoreError>;
    /// Last `limit` messages of a session, oldest first.
    async fn chat_history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    // Integrations
    /// The user's connected integration for a provider slug.
    async fn integration(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<UserIntegration>, StoreError>;
    async fn integration_by_id(&self, id: &str) -> Result<Option<UserIntegration>, StoreError>;
    async fn update_integration(&self, integration: &UserIntegration) -> Result<(), StoreError>;
    async fn integration_providers(&self) -> Result<Vec<IntegrationProvider>, StoreError>;
    async fn user_integrations(&self, user_id: &str) -> Result<Vec<UserIntegration>, StoreError>;
    async fn mcp_servers(&self, user_id: &str) -> Result<Vec<McpServer>, StoreError>;
    async fn insert_tool_log(&self, log: &ToolLog) -> Result<(), StoreError>;

    // Email
    async fn email_configs_for(
        &self,
        gmail_address: &str,
    ) -> Result<Vec<AgentEmailConfig>, StoreError>;
    async fn set_email_history_id(
        &self,
        config_id: &str,
        history_id: &str,
    ) -> Result<(), StoreError>;
    async fn email_message_exists(&self, gmail_message_id: &str) -> Result<bool, StoreError>;
    async fn insert_email(&self, msg: &EmailMessage) -> Result<EmailMessage, StoreError>;
    /// Attaches a pending AI draft to the stored message.
    async fn set_email_draft(&self, gmail_message_id: &str, draft: &str) -> Result<(), StoreError>;
    /// Last `limit` messages of a Gmail thread, oldest first.
    async fn email_thread(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<EmailMessage>, StoreError>;

    // Organizations
    async fn get_org_member(&self, id: &str) -> Result<Option<OrganizationMember>, StoreError>;
    async fn update_org_member(&self, member: &OrganizationMember) -> Result<(), StoreError>;
    async fn insert_audit_log(&self, entry: &AuditLogEntry) -> Result<(), StoreError>;
}

/// Cosine similarity, 0.0 for mismatched or zero vectors.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}
