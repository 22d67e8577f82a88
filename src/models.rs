//! Table rows.
//!
//! Every struct mirrors one PostgREST table. Ids are assigned by the store on
//! insert, so an empty id is skipped when serializing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schedule::WeeklySchedule;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    #[default]
    User,
    Admin,
    Support,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: UserRole,
    #[serde(default)]
    pub account_status: String,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub credits_balance: f64,
}

impl User {
    pub fn is_staff(&self) -> bool {
        self.account_status == "active" && matches!(self.role, UserRole::Admin | UserRole::Support)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceNumber {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub phone_number: String,
    pub user_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Contact {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub linkedin_url: Option<String>,
    #[serde(default)]
    pub twitter_url: Option<String>,
    #[serde(default)]
    pub facebook_url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub enriched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_whitelisted: bool,
}

impl Contact {
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.first_name.as_deref())
            .unwrap_or("Unknown")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    #[default]
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CallRecord {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub vendor_call_id: Option<String>,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub caller_number: Option<String>,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub sentiment: Option<Sentiment>,
    #[serde(default)]
    pub duration_seconds: Option<i64>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SmsMessage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub sender_number: String,
    pub recipient_number: String,
    pub direction: Direction,
    /// `None` when the agent stores no message content.
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub status: String,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub sentiment: Option<Sentiment>,
    #[serde(default)]
    pub is_ai_generated: bool,
    #[serde(default)]
    pub signalwire_message_sid: Option<String>,
    #[serde(default)]
    pub translation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EmailMessage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub contact_id: Option<String>,
    pub gmail_message_id: String,
    #[serde(default)]
    pub thread_id: String,
    pub from_email: String,
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(default)]
    pub to_email: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body_text: String,
    #[serde(default)]
    pub body_html: Option<String>,
    pub direction: Direction,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub is_ai_generated: bool,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub sentiment: Option<Sentiment>,
    /// Reply drafted by the agent, awaiting human approval.
    #[serde(default)]
    pub ai_draft: Option<String>,
    #[serde(default)]
    pub ai_draft_status: Option<String>,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PiiStorage {
    #[default]
    Enabled,
    Redacted,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SemanticMemoryConfig {
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
}

impl Default for SemanticMemoryConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

fn default_max_results() -> usize {
    3
}

fn default_similarity_threshold() -> f32 {
    0.75
}

fn default_language() -> String {
    "en-US".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub user_id: String,
    #[serde(default, alias = "agent_name")]
    pub name: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub texts_schedule: Option<WeeklySchedule>,
    #[serde(default)]
    pub schedule_timezone: Option<String>,
    #[serde(default)]
    pub after_hours_sms_forwarding: Option<String>,
    #[serde(default)]
    pub memory_enabled: bool,
    #[serde(default)]
    pub semantic_memory_enabled: bool,
    #[serde(default)]
    pub semantic_memory_config: Option<SemanticMemoryConfig>,
    #[serde(default)]
    pub knowledge_source_ids: Vec<String>,
    #[serde(default)]
    pub pii_storage: PiiStorage,
    #[serde(default)]
    pub translate_to: Option<String>,
    /// Per-app notification and feature switches, see `prefs`.
    #[serde(default)]
    pub functions: Option<Value>,
    #[serde(default)]
    pub llm_model: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            user_id: String::new(),
            name: None,
            system_prompt: None,
            language: default_language(),
            is_active: true,
            is_default: false,
            texts_schedule: None,
            schedule_timezone: None,
            after_hours_sms_forwarding: None,
            memory_enabled: false,
            semantic_memory_enabled: false,
            semantic_memory_config: None,
            knowledge_source_ids: Vec::new(),
            pii_storage: PiiStorage::Enabled,
            translate_to: None,
            functions: None,
            llm_model: None,
            created_at: None,
        }
    }
}

impl AgentConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Maggie")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConversationContext {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub contact_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub user_id: String,
    #[serde(default)]
    pub contact_phone: Option<String>,
    #[serde(default)]
    pub service_number: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub key_topics: Vec<String>,
    #[serde(default)]
    pub interaction_count: u32,
    #[serde(default)]
    pub sms_interaction_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub ai_paused_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub semantic_match_count: u32,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl ConversationContext {
    pub fn is_paused_at(&self, now: DateTime<Utc>) -> bool {
        self.ai_paused_until.is_some_and(|until| until > now)
    }
}

/// One row returned by the `match_similar_memories` RPC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimilarMemory {
    pub id: String,
    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub key_topics: Vec<String>,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeChunk {
    pub content: String,
    #[serde(default)]
    pub similarity: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KnowledgeSource {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub user_id: String,
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    pub sync_period: String,
    #[serde(default)]
    pub sync_status: String,
    #[serde(default)]
    pub page_urls: Vec<String>,
    #[serde(default)]
    pub crawl_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatWidget {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub widget_key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatSession {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub widget_id: String,
    pub user_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub visitor_id: String,
    #[serde(default)]
    pub visitor_name: Option<String>,
    #[serde(default)]
    pub visitor_email: Option<String>,
    #[serde(default)]
    pub page_url: Option<String>,
    #[serde(default)]
    pub browser_info: Option<Value>,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub ai_paused_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    Visitor,
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub session_id: String,
    pub role: ChatRole,
    pub content: String,
    #[serde(default)]
    pub is_ai_generated: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    #[default]
    Pending,
    Approved,
    Suspended,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    Admin,
    #[default]
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberAction {
    Approve,
    Suspend,
    Remove,
    Reinvite,
}

impl MemberAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approve" => Some(Self::Approve),
            "suspend" => Some(Self::Suspend),
            "remove" => Some(Self::Remove),
            "reinvite" => Some(Self::Reinvite),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Suspend => "suspend",
            Self::Remove => "remove",
            Self::Reinvite => "reinvite",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("cannot {action} a member whose status is {from:?}")]
pub struct TransitionError {
    pub from: MemberStatus,
    pub action: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Organization {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub owner_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrganizationMember {
    pub id: String,
    pub organization_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub role: MemberRole,
    #[serde(default)]
    pub status: MemberStatus,
    #[serde(default)]
    pub invited_by: Option<String>,
    #[serde(default)]
    pub invited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub suspended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub removed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl OrganizationMember {
    /// Applies a lifecycle transition.
    ///
    /// `pending -> approved | suspended | removed`, `suspended -> approved`
    /// (reinstate) and `removed -> pending` (re-invite). Anything else is
    /// rejected and leaves the member untouched.
    pub fn transition(
        &mut self,
        action: MemberAction,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        use MemberStatus::*;
        let next = match (self.status, action) {
            (Pending | Suspended, MemberAction::Approve) => Approved,
            (Pending | Approved, MemberAction::Suspend) => Suspended,
            (Pending | Approved | Suspended, MemberAction::Remove) => Removed,
            (Removed, MemberAction::Reinvite) => Pending,
            (from, action) => {
                return Err(TransitionError {
                    from,
                    action: action.as_str(),
                })
            }
        };
        match next {
            Approved => {
                self.approved_at = Some(now);
                self.suspended_at = None;
            }
            Suspended => self.suspended_at = Some(now),
            Removed => self.removed_at = Some(now),
            Pending => {
                self.invited_at = Some(now);
                self.approved_at = None;
                self.suspended_at = None;
                self.removed_at = None;
            }
        }
        self.status = next;
        self.updated_at = Some(now);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptStatus {
    OptedOut,
    OptedIn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsOptOut {
    pub phone_number: String,
    pub status: OptStatus,
    #[serde(default)]
    pub opted_out_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub opted_in_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledAction {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub user_id: String,
    pub action_type: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: String,
    pub parameters: Value,
    #[serde(default)]
    pub created_via: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolLog {
    pub user_id: String,
    pub tool_name: String,
    pub tool_source: String,
    pub input: Value,
    pub output: Value,
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
    #[serde(default)]
    pub context: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IntegrationProvider {
    pub id: String,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserIntegration {
    pub id: String,
    pub user_id: String,
    /// Provider slug, e.g. `slack`, `hubspot`, `google_email`, `cal_com`.
    pub provider: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub connected_at: Option<DateTime<Utc>>,
}

impl UserIntegration {
    pub fn is_connected(&self) -> bool {
        self.status == "connected"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct McpToolDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpServer {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub server_url: String,
    /// Bearer credential sent to the server, if any.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Set for servers connected from the shared catalog.
    #[serde(default)]
    pub catalog_slug: Option<String>,
    #[serde(default)]
    pub tools: Vec<McpToolDef>,
}

impl McpServer {
    /// Catalog slug, or the lowercased name with each run of
    /// non-alphanumerics collapsed to `_`.
    pub fn slug(&self) -> String {
        if let Some(slug) = &self.catalog_slug {
            return slug.clone();
        }
        let mut out = String::with_capacity(self.name.len());
        let mut in_gap = false;
        for c in self.name.to_lowercase().chars() {
            if c.is_ascii_alphanumeric() {
                out.push(c);
                in_gap = false;
            } else if !in_gap {
                out.push('_');
                in_gap = true;
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmailAgentMode {
    Auto,
    #[default]
    Draft,
    Off,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentEmailConfig {
    pub id: String,
    pub user_id: String,
    pub agent_id: String,
    pub gmail_address: String,
    #[serde(default)]
    pub send_as_email: Option<String>,
    #[serde(default)]
    pub integration_id: Option<String>,
    #[serde(default)]
    pub agent_mode: EmailAgentMode,
    #[serde(default)]
    pub last_history_id: Option<String>,
    #[serde(default)]
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub admin_user_id: String,
    #[serde(default)]
    pub target_user_id: Option<String>,
    pub action: String,
    #[serde(default)]
    pub details: Value,
}
