//! Staff-only organization membership management.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::json;

use crate::http::{bearer_token, error};
use crate::models::{AuditLogEntry, MemberAction, User};
use crate::AppState;

/// Handle POST /api/orgs/members/{id}/{action}
pub async fn handle_member_action(
    State(state): State<AppState>,
    Path((member_id, action)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let staff = match require_staff(&state, &headers).await {
        Ok(user) => user,
        Err(resp) => return resp,
    };

    let Some(action) = MemberAction::parse(&action) else {
        return error(StatusCode::BAD_REQUEST, format!("Unknown action: {action}"));
    };

    let mut member = match state.store.get_org_member(&member_id).await {
        Ok(Some(m)) => m,
        Ok(None) => return error(StatusCode::NOT_FOUND, "Member not found"),
        Err(e) => {
            tracing::error!(%member_id, "Member lookup failed: {e}");
            return error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
        }
    };

    let from = member.status;
    if let Err(e) = member.transition(action, Utc::now()) {
        return error(StatusCode::CONFLICT, e.to_string());
    }
    if let Err(e) = state.store.update_org_member(&member).await {
        tracing::error!(%member_id, "Member update failed: {e}");
        return error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to update member");
    }

    let entry = AuditLogEntry {
        admin_user_id: staff.id.clone(),
        target_user_id: member.user_id.clone(),
        action: format!("org_member_{}", action.as_str()),
        details: json!({
            "member_id": member.id,
            "organization_id": member.organization_id,
            "email": member.email,
            "from": from,
            "to": member.status,
        }),
    };
    if let Err(e) = state.store.insert_audit_log(&entry).await {
        tracing::warn!(%member_id, "Audit log write failed: {e}");
    }

    tracing::info!(
        admin = %staff.id,
        %member_id,
        action = action.as_str(),
        "Membership updated"
    );
    Json(json!({ "success": true, "member": member })).into_response()
}

#[allow(clippy::result_large_err)]
async fn require_staff(state: &AppState, headers: &HeaderMap) -> Result<User, Response> {
    let Some(token) = bearer_token(headers) else {
        return Err(error(StatusCode::UNAUTHORIZED, "Missing authorization header"));
    };
    let user_id = match state.store.user_id_for_token(token).await {
        Ok(Some(id)) => id,
        Ok(None) => return Err(error(StatusCode::UNAUTHORIZED, "Invalid authorization token")),
        Err(e) => {
            tracing::error!("Token lookup failed: {e}");
            return Err(error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"));
        }
    };
    match state.store.get_user(&user_id).await {
        Ok(Some(user)) if user.is_staff() => Ok(user),
        Ok(_) => {
            tracing::warn!(%user_id, "Non-staff membership change attempt");
            Err(error(StatusCode::FORBIDDEN, "Admin access required"))
        }
        Err(e) => {
            tracing::error!(%user_id, "User lookup failed: {e}");
            Err(error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"))
        }
    }
}
