//! # Site Access Checks
//!
//! Decides whether a token holder may view (or command) a site.
//!
//! ```text
//!  token ──► JwtManager::validate ──✗──► Auth
//!                   │
//!                   ▼
//!  site_id ──► sites.get_by_id ──────✗──► NotFound
//!                   │
//!                   ▼
//!       site.tenant_id == claims.tenant_id ──✗──► Denied
//!                   │
//!                   ▼
//!       role is owner/admin ─── or ─── explicit grant ──✗──► Denied
//!                   │
//!                   ▼
//!              Authorized { site, claims }
//! ```
//!
//! The check suspends on storage I/O, which is why the registry stamps each
//! request with a sequence number.

use std::future::Future;
use std::sync::Arc;

use canopy_core::Site;
use canopy_db::Database;
use tracing::debug;

use crate::auth::{Claims, JwtManager};

// =============================================================================
// Errors
// =============================================================================

/// Why an access check failed. Each is surfaced to the caller as-is.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AccessError {
    /// Missing, malformed or expired credential.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Site belongs to another tenant, or the caller lacks a grant/role.
    #[error("Access denied to site {0}")]
    Denied(String),

    #[error("Site not found: {0}")]
    NotFound(String),

    /// Storage failed while checking; the caller may retry.
    #[error("Access check unavailable: {0}")]
    Unavailable(String),
}

/// A successful check.
#[derive(Debug, Clone, PartialEq)]
pub struct Authorized {
    pub site: Site,
    pub claims: Claims,
}

// =============================================================================
// Policy
// =============================================================================

/// Resolves `(site_id, token)` to an authorization.
pub trait AccessPolicy: Send + Sync + 'static {
    fn check(
        &self,
        site_id: &str,
        token: &str,
    ) -> impl Future<Output = Result<Authorized, AccessError>> + Send;
}

impl<P: AccessPolicy> AccessPolicy for Arc<P> {
    fn check(
        &self,
        site_id: &str,
        token: &str,
    ) -> impl Future<Output = Result<Authorized, AccessError>> + Send {
        (**self).check(site_id, token)
    }
}

/// Production policy: JWT plus tenant, role and grant lookups.
pub struct DbAccessPolicy {
    db: Database,
    jwt: Arc<JwtManager>,
}

impl DbAccessPolicy {
    pub fn new(db: Database, jwt: Arc<JwtManager>) -> Self {
        DbAccessPolicy { db, jwt }
    }
}

impl AccessPolicy for DbAccessPolicy {
    async fn check(&self, site_id: &str, token: &str) -> Result<Authorized, AccessError> {
        let claims = self.jwt.validate(token)?;

        let site = self
            .db
            .sites()
            .get_by_id(site_id)
            .await
            .map_err(|e| AccessError::Unavailable(e.to_string()))?
            .ok_or_else(|| AccessError::NotFound(site_id.to_string()))?;

        if site.tenant_id != claims.tenant_id {
            debug!(site_id = %site_id, user = %claims.sub, "Tenant mismatch");
            return Err(AccessError::Denied(site_id.to_string()));
        }

        if !claims.role.is_elevated() {
            let granted = self
                .db
                .grants()
                .has_grant(&claims.sub, &site.id)
                .await
                .map_err(|e| AccessError::Unavailable(e.to_string()))?;

            if !granted {
                debug!(site_id = %site_id, user = %claims.sub, "No grant for site");
                return Err(AccessError::Denied(site_id.to_string()));
            }
        }

        Ok(Authorized { site, claims })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
