use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{CreditDeduction, SimilarMemoryQuery, Store, StoreError};
use crate::models::*;

type Query = Vec<(&'static str, String)>;

fn eq(v: impl std::fmt::Display) -> String {
    format!("eq.{v}")
}

/// Store backed by Supabase's PostgREST and auth endpoints.
pub struct SupabaseStore {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
}

impl SupabaseStore {
    pub fn new(base_url: &str, service_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
        }
    }

    fn table(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, StoreError> {
        let resp = self
            .authed(req)
            .send()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Api(format!("{status}: {body}")));
        }
        Ok(resp)
    }

    async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, StoreError> {
        resp.json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: Query,
    ) -> Result<Vec<T>, StoreError> {
        let resp = self
            .send(self.client.get(self.table(table)).query(&query))
            .await?;
        Self::decode(resp).await
    }

    async fn select_one<T: DeserializeOwned>(
        &self,
        table: &str,
        mut query: Query,
    ) -> Result<Option<T>, StoreError> {
        query.push(("limit", "1".to_string()));
        Ok(self.select(table, query).await?.into_iter().next())
    }

    async fn insert<T: Serialize + Sync, R: DeserializeOwned>(
        &self,
        table: &str,
        row: &T,
    ) -> Result<R, StoreError> {
        let resp = self
            .send(
                self.client
                    .post(self.table(table))
                    .header("Prefer", "return=representation")
                    .json(row),
            )
            .await?;
        let rows: Vec<R> = Self::decode(resp).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(format!("{table}: insert returned no row")))
    }

    async fn insert_quiet<T: Serialize + Sync>(&self, table: &str, row: &T) -> Result<(), StoreError> {
        self.send(
            self.client
                .post(self.table(table))
                .header("Prefer", "return=minimal")
                .json(row),
        )
        .await?;
        Ok(())
    }

    async fn upsert<T: Serialize + Sync>(
        &self,
        table: &str,
        on_conflict: &str,
        row: &T,
    ) -> Result<(), StoreError> {
        self.send(
            self.client
                .post(self.table(table))
                .query(&[("on_conflict", on_conflict)])
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(row),
        )
        .await?;
        Ok(())
    }

    async fn patch<T: Serialize + Sync>(
        &self,
        table: &str,
        query: Query,
        body: &T,
    ) -> Result<(), StoreError> {
        self.send(
            self.client
                .patch(self.table(table))
                .query(&query)
                .header("Prefer", "return=minimal")
                .json(body),
        )
        .await?;
        Ok(())
    }

    async fn rpc<R: DeserializeOwned>(&self, function: &str, params: Value) -> Result<R, StoreError> {
        let url = format!("{}/rest/v1/rpc/{function}", self.base_url);
        let resp = self.send(self.client.post(url).json(&params)).await?;
        Self::decode(resp).await
    }
}

#[derive(Deserialize)]
struct ProviderRef {
    slug: String,
}

#[derive(Deserialize)]
struct IntegrationRow {
    id: String,
    user_id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    config: Option<Value>,
    #[serde(default)]
    connected_at: Option<DateTime<Utc>>,
    integration_providers: ProviderRef,
}

impl From<IntegrationRow> for UserIntegration {
    fn from(row: IntegrationRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            provider: row.integration_providers.slug,
            status: row.status,
            access_token: row.access_token,
            refresh_token: row.refresh_token,
            token_expires_at: row.token_expires_at,
            config: row.config,
            connected_at: row.connected_at,
        }
    }
}

const INTEGRATION_SELECT: &str = "*,integration_providers!inner(slug)";

#[derive(Deserialize)]
struct CustomMcpRow {
    id: String,
    user_id: String,
    name: String,
    server_url: String,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    tools_cache: Option<Vec<McpToolDef>>,
}

#[derive(Deserialize)]
struct CatalogRef {
    name: String,
    slug: String,
    #[serde(default)]
    server_url: String,
}

#[derive(Deserialize)]
struct CatalogMcpRow {
    id: String,
    user_id: String,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    tools_cache: Option<Vec<McpToolDef>>,
    catalog: Option<CatalogRef>,
}

#[derive(Deserialize)]
struct IdRow {
    id: String,
}

#[derive(Deserialize)]
struct AuthUser {
    id: String,
}

#[derive(Deserialize)]
struct AreaCodeRow {
    area_code: String,
}

#[async_trait]
impl Store for SupabaseStore {
    async fn get_user(&self, id: &str) -> Result<Option<User>, StoreError> {
        self.select_one("users", vec![("id", eq(id))]).await
    }

    async fn user_id_for_token(&self, token: &str) -> Result<Option<String>, StoreError> {
        let resp = self
            .client
            .get(format!("{}/auth/v1/user", self.base_url))
            .header("apikey", &self.service_key)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Ok(None);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Api(format!("{status}: {body}")));
        }
        let user: AuthUser = Self::decode(resp).await?;
        Ok(Some(user.id))
    }

    async fn deduct_credits(
        &self,
        user_id: &str,
        amount: f64,
        description: &str,
        reference_type: &str,
    ) -> Result<CreditDeduction, StoreError> {
        self.rpc(
            "deduct_credits",
            json!({
                "p_user_id": user_id,
                "p_amount": amount,
                "p_description": description,
                "p_reference_type": reference_type,
                "p_reference_id": null,
                "p_metadata": { "type": reference_type },
            }),
        )
        .await
    }

    async fn active_service_number(
        &self,
        phone: &str,
    ) -> Result<Option<ServiceNumber>, StoreError> {
        self.select_one(
            "service_numbers",
            vec![("phone_number", eq(phone)), ("is_active", eq(true))],
        )
        .await
    }

    async fn first_service_number(
        &self,
        user_id: &str,
    ) -> Result<Option<ServiceNumber>, StoreError> {
        self.select_one(
            "service_numbers",
            vec![
                ("user_id", eq(user_id)),
                ("is_active", eq(true)),
                ("order", "created_at.asc".into()),
            ],
        )
        .await
    }

    async fn get_agent(&self, id: &str) -> Result<Option<AgentConfig>, StoreError> {
        self.select_one("agent_configs", vec![("id", eq(id))]).await
    }

    async fn default_agent(&self, user_id: &str) -> Result<Option<AgentConfig>, StoreError> {
        self.select_one(
            "agent_configs",
            vec![("user_id", eq(user_id)), ("is_default", eq(true))],
        )
        .await
    }

    async fn oldest_agent(&self, user_id: &str) -> Result<Option<AgentConfig>, StoreError> {
        self.select_one(
            "agent_configs",
            vec![("user_id", eq(user_id)), ("order", "created_at.asc".into())],
        )
        .await
    }

    async fn update_agent_prompt(&self, agent_id: &str, prompt: &str) -> Result<(), StoreError> {
        self.patch(
            "agent_configs",
            vec![("id", eq(agent_id))],
            &json!({ "system_prompt": prompt, "updated_at": Utc::now() }),
        )
        .await
    }

    async fn list_contacts(&self, user_id: &str) -> Result<Vec<Contact>, StoreError> {
        self.select(
            "contacts",
            vec![("user_id", eq(user_id)), ("order", "name.asc".into())],
        )
        .await
    }

    async fn find_contact_by_phone(
        &self,
        user_id: &str,
        phone: &str,
    ) -> Result<Option<Contact>, StoreError> {
        self.select_one(
            "contacts",
            vec![("user_id", eq(user_id)), ("phone_number", eq(phone))],
        )
        .await
    }

    async fn find_contact_by_email(
        &self,
        user_id: &str,
        email: &str,
    ) -> Result<Option<Contact>, StoreError> {
        self.select_one(
            "contacts",
            vec![("user_id", eq(user_id)), ("email", format!("ilike.{email}"))],
        )
        .await
    }

    async fn insert_contact(&self, contact: &Contact) -> Result<Contact, StoreError> {
        self.insert("contacts", contact).await
    }

    async fn update_contact(&self, contact: &Contact) -> Result<(), StoreError> {
        self.patch("contacts", vec![("id", eq(&contact.id))], contact)
            .await
    }

    async fn find_context(
        &self,
        contact_id: &str,
        agent_id: Option<&str>,
    ) -> Result<Option<ConversationContext>, StoreError> {
        let agent_filter = match agent_id {
            Some(id) => eq(id),
            None => "is.null".to_string(),
        };
        self.select_one(
            "conversation_contexts",
            vec![
                ("contact_id", eq(contact_id)),
                ("agent_id", agent_filter),
                ("order", "last_updated.desc".into()),
            ],
        )
        .await
    }

    async fn find_thread_context(
        &self,
        user_id: &str,
        contact_phone: &str,
        service_number: &str,
    ) -> Result<Option<ConversationContext>, StoreError> {
        self.select_one(
            "conversation_contexts",
            vec![
                ("user_id", eq(user_id)),
                ("contact_phone", eq(contact_phone)),
                ("service_number", eq(service_number)),
            ],
        )
        .await
    }

    async fn insert_context(
        &self,
        ctx: &ConversationContext,
    ) -> Result<ConversationContext, StoreError> {
        self.insert("conversation_contexts", ctx).await
    }

    async fn update_context(&self, ctx: &ConversationContext) -> Result<(), StoreError> {
        self.patch("conversation_contexts", vec![("id", eq(&ctx.id))], ctx)
            .await
    }

    async fn match_similar_memories(
        &self,
        query: &SimilarMemoryQuery<'_>,
    ) -> Result<Vec<SimilarMemory>, StoreError> {
        self.rpc(
            "match_similar_memories",
            json!({
                "query_embedding": query.embedding,
                "match_agent_id": query.agent_id,
                "match_user_id": query.user_id,
                "exclude_contact_id": query.exclude_contact_id,
                "match_threshold": query.threshold,
                "match_count": query.limit,
            }),
        )
        .await
    }

    async fn increment_semantic_match_counts(&self, ids: &[String]) -> Result<(), StoreError> {
        let _: Value = self
            .rpc(
                "increment_semantic_match_count_batch",
                json!({ "memory_ids": ids }),
            )
            .await?;
        Ok(())
    }

    async fn match_knowledge_chunks(
        &self,
        embedding: &[f32],
        source_ids: &[String],
        limit: usize,
        threshold: f32,
    ) -> Result<Vec<KnowledgeChunk>, StoreError> {
        self.rpc(
            "match_knowledge_chunks",
            json!({
                "query_embedding": embedding,
                "source_ids": source_ids,
                "match_count": limit,
                "similarity_threshold": threshold,
            }),
        )
        .await
    }

    async fn knowledge_chunks(
        &self,
        source_ids: &[String],
        limit: usize,
    ) -> Result<Vec<KnowledgeChunk>, StoreError> {
        self.select(
            "knowledge_chunks",
            vec![
                ("select", "content".into()),
                ("knowledge_source_id", format!("in.({})", source_ids.join(","))),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }

    async fn insert_knowledge_source(
        &self,
        source: &KnowledgeSource,
    ) -> Result<KnowledgeSource, StoreError> {
        self.insert("knowledge_sources", source).await
    }

    async fn insert_sms(&self, msg: &SmsMessage) -> Result<SmsMessage, StoreError> {
        self.insert("sms_messages", msg).await
    }

    async fn recent_sms(
        &self,
        user_id: &str,
        contact_phone: &str,
        limit: usize,
    ) -> Result<Vec<SmsMessage>, StoreError> {
        self.select(
            "sms_messages",
            vec![
                ("user_id", eq(user_id)),
                (
                    "or",
                    format!(
                        "(sender_number.eq.{contact_phone},recipient_number.eq.{contact_phone})"
                    ),
                ),
                ("order", "sent_at.desc".into()),
                ("limit", limit.to_string()),
            ],
        )
        .await
    }

    async fn set_latest_sms_translation(
        &self,
        user_id: &str,
        sender: &str,
        recipient: &str,
        direction: Direction,
        translation: &str,
    ) -> Result<Option<String>, StoreError> {
        let direction = match direction {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        };
        let latest: Option<IdRow> = self
            .select_one(
                "sms_messages",
                vec![
                    ("select", "id".into()),
                    ("user_id", eq(user_id)),
                    ("sender_number", eq(sender)),
                    ("recipient_number", eq(recipient)),
                    ("direction", eq(direction)),
                    ("order", "sent_at.desc".into()),
                ],
            )
            .await?;
        let Some(row) = latest else {
            return Ok(None);
        };
        self.patch(
            "sms_messages",
            vec![("id", eq(&row.id))],
            &json!({ "translation": translation }),
        )
        .await?;
        Ok(Some(row.id))
    }

    async fn opt_out_status(&self, phone: &str) -> Result<Option<SmsOptOut>, StoreError> {
        self.select_one("sms_opt_outs", vec![("phone_number", eq(phone))])
            .await
    }

    async fn upsert_opt_out(&self, row: &SmsOptOut) -> Result<(), StoreError> {
        self.upsert("sms_opt_outs", "phone_number", row).await
    }

    async fn canadian_area_codes(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<AreaCodeRow> = self
            .select(
                "area_codes",
                vec![("select", "area_code".into()), ("country", eq("Canada"))],
            )
            .await?;
        Ok(rows.into_iter().map(|r| r.area_code).collect())
    }

    async fn insert_scheduled_action(
        &self,
        action: &ScheduledAction,
    ) -> Result<ScheduledAction, StoreError> {
        self.insert("scheduled_actions", action).await
    }

    async fn find_call_by_sid(&self, sid: &str) -> Result<Option<CallRecord>, StoreError> {
        self.select_one(
            "call_records",
            vec![("or", format!("(vendor_call_id.eq.{sid},call_sid.eq.{sid})"))],
        )
        .await
    }

    async fn update_call(&self, call: &CallRecord) -> Result<(), StoreError> {
        self.patch("call_records", vec![("id", eq(&call.id))], call)
            .await
    }

    async fn active_widget(&self, widget_key: &str) -> Result<Option<ChatWidget>, StoreError> {
        self.select_one(
            "chat_widgets",
            vec![("widget_key", eq(widget_key)), ("is_active", eq(true))],
        )
        .await
    }

    async fn active_chat_session(
        &self,
        widget_id: &str,
        visitor_id: &str,
    ) -> Result<Option<ChatSession>, StoreError> {
        self.select_one(
            "chat_sessions",
            vec![
                ("widget_id", eq(widget_id)),
                ("visitor_id", eq(visitor_id)),
                ("status", eq("active")),
                ("order", "created_at.desc".into()),
            ],
        )
        .await
    }

    async fn insert_chat_session(&self, session: &ChatSession) -> Result<ChatSession, StoreError> {
        self.insert("chat_sessions", session).await
    }

    async fn update_chat_session(&self, session: &ChatSession) -> Result<(), StoreError> {
        self.patch("chat_sessions", vec![("id", eq(&session.id))], session)
            .await
    }

    async fn insert_chat_message(&self, msg: &ChatMessage) -> Result<ChatMessage, StoreError> {
        self.insert("chat_messages", msg).await
    }

    async fn chat_history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let mut rows: Vec<ChatMessage> = self
            .select(
                "chat_messages",
                vec![
                    ("session_id", eq(session_id)),
                    ("order", "created_at.desc".into()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        rows.reverse();
        Ok(rows)
    }

    async fn integration(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<UserIntegration>, StoreError> {
        let row: Option<IntegrationRow> = self
            .select_one(
                "user_integrations",
                vec![
                    ("select", INTEGRATION_SELECT.into()),
                    ("user_id", eq(user_id)),
                    ("status", eq("connected")),
                    ("integration_providers.slug", eq(provider)),
                ],
            )
            .await?;
        Ok(row.map(Into::into))
    }

    async fn integration_by_id(&self, id: &str) -> Result<Option<UserIntegration>, StoreError> {
        let row: Option<IntegrationRow> = self
            .select_one(
                "user_integrations",
                vec![("select", INTEGRATION_SELECT.into()), ("id", eq(id))],
            )
            .await?;
        Ok(row.map(Into::into))
    }

    async fn update_integration(&self, integration: &UserIntegration) -> Result<(), StoreError> {
        self.patch(
            "user_integrations",
            vec![("id", eq(&integration.id))],
            &json!({
                "status": integration.status,
                "access_token": integration.access_token,
                "refresh_token": integration.refresh_token,
                "token_expires_at": integration.token_expires_at,
                "config": integration.config,
                "updated_at": Utc::now(),
            }),
        )
        .await
    }

    async fn integration_providers(&self) -> Result<Vec<IntegrationProvider>, StoreError> {
        self.select(
            "integration_providers",
            vec![("enabled", eq(true)), ("order", "name.asc".into())],
        )
        .await
    }

    async fn user_integrations(&self, user_id: &str) -> Result<Vec<UserIntegration>, StoreError> {
        let rows: Vec<IntegrationRow> = self
            .select(
                "user_integrations",
                vec![("select", INTEGRATION_SELECT.into()), ("user_id", eq(user_id))],
            )
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn mcp_servers(&self, user_id: &str) -> Result<Vec<McpServer>, StoreError> {
        let custom: Vec<CustomMcpRow> = self
            .select(
                "user_mcp_servers",
                vec![("user_id", eq(user_id)), ("status", eq("active"))],
            )
            .await?;
        let catalog: Vec<CatalogMcpRow> = self
            .select(
                "user_mcp_connections",
                vec![
                    (
                        "select",
                        "id,user_id,access_token,tools_cache,catalog:mcp_server_catalog(name,slug,server_url)"
                            .into(),
                    ),
                    ("user_id", eq(user_id)),
                    ("status", eq("connected")),
                ],
            )
            .await?;

        let mut servers: Vec<McpServer> = custom
            .into_iter()
            .map(|row| McpServer {
                id: row.id,
                user_id: row.user_id,
                name: row.name,
                server_url: row.server_url,
                access_token: row.api_key,
                catalog_slug: None,
                tools: row.tools_cache.unwrap_or_default(),
            })
            .collect();
        servers.extend(catalog.into_iter().filter_map(|row| {
            let cat = row.catalog?;
            Some(McpServer {
                id: row.id,
                user_id: row.user_id,
                name: cat.name,
                server_url: cat.server_url,
                access_token: row.access_token,
                catalog_slug: Some(cat.slug),
                tools: row.tools_cache.unwrap_or_default(),
            })
        }));
        Ok(servers)
    }

    async fn insert_tool_log(&self, log: &ToolLog) -> Result<(), StoreError> {
        self.insert_quiet("integration_tool_logs", log).await
    }

    async fn email_configs_for(
        &self,
        gmail_address: &str,
    ) -> Result<Vec<AgentEmailConfig>, StoreError> {
        self.select(
            "agent_email_configs",
            vec![
                ("gmail_address", format!("ilike.{gmail_address}")),
                ("is_active", eq(true)),
            ],
        )
        .await
    }

    async fn set_email_history_id(
        &self,
        config_id: &str,
        history_id: &str,
    ) -> Result<(), StoreError> {
        self.patch(
            "agent_email_configs",
            vec![("id", eq(config_id))],
            &json!({ "last_history_id": history_id }),
        )
        .await
    }

    async fn email_message_exists(&self, gmail_message_id: &str) -> Result<bool, StoreError> {
        let row: Option<IdRow> = self
            .select_one(
                "email_messages",
                vec![
                    ("select", "id".into()),
                    ("gmail_message_id", eq(gmail_message_id)),
                ],
            )
            .await?;
        Ok(row.is_some())
    }

    async fn insert_email(&self, msg: &EmailMessage) -> Result<EmailMessage, StoreError> {
        self.insert("email_messages", msg).await
    }

    async fn set_email_draft(&self, gmail_message_id: &str, draft: &str) -> Result<(), StoreError> {
        self.patch(
            "email_messages",
            vec![("gmail_message_id", eq(gmail_message_id))],
            &json!({ "ai_draft": draft, "ai_draft_status": "pending" }),
        )
        .await
    }

    async fn email_thread(
        &self,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<EmailMessage>, StoreError> {
        let mut rows: Vec<EmailMessage> = self
            .select(
                "email_messages",
                vec![
                    ("thread_id", eq(thread_id)),
                    ("order", "sent_at.desc".into()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        rows.reverse();
        Ok(rows)
    }

    async fn get_org_member(&self, id: &str) -> Result<Option<OrganizationMember>, StoreError> {
        self.select_one("organization_members", vec![("id", eq(id))])
            .await
    }

    async fn update_org_member(&self, member: &OrganizationMember) -> Result<(), StoreError> {
        self.patch(
            "organization_members",
            vec![("id", eq(&member.id))],
            member,
        )
        .await
    }

    async fn insert_audit_log(&self, entry: &AuditLogEntry) -> Result<(), StoreError> {
        self.insert_quiet("admin_audit_log", entry).await
    }
}
