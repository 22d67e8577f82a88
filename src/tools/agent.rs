use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_args, Mode, ToolResponse};
use crate::crawl::SYNC_PERIODS;
use crate::models::{AgentConfig, KnowledgeSource};
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Modification {
    #[default]
    Replace,
    Append,
}

#[derive(Deserialize)]
struct PromptArgs {
    new_prompt: String,
    #[serde(default)]
    modification_type: Modification,
}

async fn primary_agent(state: &AppState, user_id: &str) -> Option<AgentConfig> {
    match state.store.default_agent(user_id).await {
        Ok(Some(agent)) => return Some(agent),
        Ok(None) => {}
        Err(e) => tracing::warn!(user_id, "Default agent lookup failed: {e}"),
    }
    state.store.oldest_agent(user_id).await.ok().flatten()
}

pub(super) async fn update_prompt(state: &AppState, user_id: &str, args: &Value, mode: Mode) -> ToolResponse {
    let args: PromptArgs = match parse_args("update_system_prompt", args) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let Some(agent) = primary_agent(state, user_id).await else {
        return ToolResponse::fail("You don't have an agent to update yet.");
    };

    let prompt = match (args.modification_type, agent.system_prompt.as_deref()) {
        (Modification::Append, Some(current)) if !current.trim().is_empty() => {
            format!("{current}\n\n{}", args.new_prompt)
        }
        _ => args.new_prompt.clone(),
    };

    if mode == Mode::Preview {
        let kind = match args.modification_type {
            Modification::Append => "append",
            Modification::Replace => "replace",
        };
        return ToolResponse::pending(
            "update_system_prompt",
            format!("Proposed new prompt:\n\n{}", args.new_prompt),
            json!({ "new_prompt": args.new_prompt, "modification_type": kind, "agent_id": agent.id }),
        );
    }

    match state.store.update_agent_prompt(&agent.id, &prompt).await {
        Ok(()) => {
            tracing::info!(user_id, agent_id = %agent.id, "System prompt updated by agent tool");
            ToolResponse::ok("System prompt updated successfully.")
        }
        Err(e) => ToolResponse::fail(format!("Failed to update prompt: {e}")),
    }
}

fn default_sync_period() -> String {
    "7d".to_string()
}

#[derive(Deserialize)]
struct SourceArgs {
    url: String,
    #[serde(default = "default_sync_period")]
    sync_period: String,
}

pub(super) async fn add_knowledge_source(
    state: &AppState,
    user_id: &str,
    args: &Value,
    mode: Mode,
) -> ToolResponse {
    let args: SourceArgs = match parse_args("add_knowledge_source", args) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    if !SYNC_PERIODS.contains(&args.sync_period.as_str()) {
        return ToolResponse::fail(format!(
            "Invalid sync_period. Must be one of: {}",
            SYNC_PERIODS.join(", ")
        ));
    }
    let url = args.url.trim().to_string();

    if mode == Mode::Preview {
        return ToolResponse::pending(
            "add_knowledge_source",
            format!("Will add knowledge from: {url}"),
            json!({ "url": url, "sync_period": args.sync_period }),
        );
    }

    let plan = match state.crawler.plan(&url).await {
        Ok(plan) => plan,
        Err(e) => return ToolResponse::fail(e.to_string()),
    };
    let source = KnowledgeSource {
        user_id: user_id.to_string(),
        url: plan.url,
        sync_period: args.sync_period,
        sync_status: "pending".into(),
        page_urls: plan.page_urls,
        crawl_delay_secs: plan.crawl_delay_secs,
        ..Default::default()
    };
    match state.store.insert_knowledge_source(&source).await {
        Ok(saved) => {
            tracing::info!(user_id, source_id = %saved.id, pages = saved.page_urls.len(), "Knowledge source added");
            ToolResponse::ok(format!("Added knowledge source: {url}")).with_result(json!({
                "id": saved.id,
                "url": saved.url,
                "sync_period": saved.sync_period,
                "pages": saved.page_urls.len(),
            }))
        }
        Err(e) => {
            tracing::error!(user_id, "Failed to add knowledge source: {e}");
            ToolResponse::fail("Failed to add knowledge source")
        }
    }
}
