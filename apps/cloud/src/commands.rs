//! # Command Forwarding
//!
//! Operator actions travel to a site as `command` (or `config-update`)
//! messages. The relay never changes site state itself; it forwards and
//! records.
//!
//! ```text
//!  POST /api/sites/{id}/commands
//!        │  bearer token
//!        ▼
//!  AccessPolicy::check ──✗──► 401 / 403 / 404
//!        │  role ≥ operator
//!        ▼
//!  CommandRecord (origin = remote) ──► bridge.publish ──✗──► result = failure
//!        │
//!        ▼
//!  commands.append (exactly once) ──► 202 Accepted | 503 with the record
//! ```

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use canopy_bridge::{Bridge, CommandMessage, ConfigUpdateMessage, SiteMessage};
use canopy_core::{CommandOrigin, CommandRecord, CommandResult, Site, UserRole};
use canopy_db::Database;

use crate::access::{AccessError, AccessPolicy, Authorized};
use crate::error::{RelayError, RelayResult};
use crate::hub::AppState;

/// Audit name for configuration pushes.
pub const CONFIG_UPDATE: &str = "config-update";

// =============================================================================
// Forwarder
// =============================================================================

pub struct CommandForwarder {
    db: Database,
    bridge: Arc<dyn Bridge>,
}

impl CommandForwarder {
    pub fn new(db: Database, bridge: Arc<dyn Bridge>) -> Self {
        CommandForwarder { db, bridge }
    }

    /// Publishes `command` to `site` and records it.
    ///
    /// A rejected publish is not an error here: the record is stored with
    /// `result = failure` and returned.
    pub async fn forward(
        &self,
        site: &Site,
        command: &str,
        detail: serde_json::Value,
        issued_by: Option<String>,
    ) -> RelayResult<CommandRecord> {
        let now = Utc::now();
        let record = CommandRecord::new(&site.id, command, detail, CommandOrigin::Remote, issued_by, now);

        let message = SiteMessage::Command(CommandMessage {
            timestamp: now,
            command_id: record.id.clone(),
            command: command.to_string(),
            detail: record.detail.clone(),
            issued_by: record.issued_by.clone(),
        });

        self.publish_and_record(site, &message, record).await
    }

    /// Pushes a full configuration document to `site`.
    pub async fn push_config(
        &self,
        site: &Site,
        version: i64,
        document: serde_json::Value,
        issued_by: Option<String>,
    ) -> RelayResult<CommandRecord> {
        let now = Utc::now();
        let record = CommandRecord::new(
            &site.id,
            CONFIG_UPDATE,
            json!({ "version": version }),
            CommandOrigin::Remote,
            issued_by,
            now,
        );

        let message = SiteMessage::ConfigUpdate(ConfigUpdateMessage {
            timestamp: now,
            version,
            document,
        });

        self.publish_and_record(site, &message, record).await
    }

    async fn publish_and_record(
        &self,
        site: &Site,
        message: &SiteMessage,
        record: CommandRecord,
    ) -> RelayResult<CommandRecord> {
        let record = match self.bridge.publish(&site.name, message) {
            Ok(()) => {
                info!(
                    site = %site.name,
                    command = %record.command_type,
                    issued_by = ?record.issued_by,
                    "Command forwarded"
                );
                record
            }
            Err(e) => {
                warn!(site = %site.name, command = %record.command_type, error = %e, "Command not forwarded");
                record.failed(e.to_string())
            }
        };

        self.db.commands().append(&record).await?;
        Ok(record)
    }
}

// =============================================================================
// HTTP
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub detail: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRequest {
    pub version: i64,
    pub document: serde_json::Value,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/sites/{site_id}/commands", post(submit_command))
        .route("/api/sites/{site_id}/config", post(submit_config))
}

pub async fn submit_command(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<CommandRequest>,
) -> RelayResult<(StatusCode, Json<CommandRecord>)> {
    if request.command.trim().is_empty() {
        return Err(RelayError::BadRequest("command is required".to_string()));
    }

    let auth = authorize_operator(&state, &site_id, &headers).await?;
    let record = state
        .forwarder
        .forward(&auth.site, &request.command, request.detail, Some(auth.claims.sub))
        .await?;

    Ok((accepted_or_unavailable(&record), Json(record)))
}

pub async fn submit_config(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ConfigRequest>,
) -> RelayResult<(StatusCode, Json<CommandRecord>)> {
    if request.version <= 0 {
        return Err(RelayError::BadRequest("version must be positive".to_string()));
    }

    let auth = authorize_operator(&state, &site_id, &headers).await?;
    let record = state
        .forwarder
        .push_config(&auth.site, request.version, request.document, Some(auth.claims.sub))
        .await?;

    Ok((accepted_or_unavailable(&record), Json(record)))
}

/// Site access plus a role that may act, not just watch.
async fn authorize_operator(state: &AppState, site_id: &str, headers: &HeaderMap) -> RelayResult<Authorized> {
    let token = bearer_token(headers)
        .ok_or_else(|| AccessError::Auth("Missing bearer token".to_string()))?;

    let auth = state.policy.check(site_id, token).await?;
    if auth.claims.role == UserRole::Viewer {
        return Err(AccessError::Denied(site_id.to_string()).into());
    }
    Ok(auth)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

fn accepted_or_unavailable(record: &CommandRecord) -> StatusCode {
    match record.result {
        CommandResult::Success => StatusCode::ACCEPTED,
        CommandResult::Failure => StatusCode::SERVICE_UNAVAILABLE,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
