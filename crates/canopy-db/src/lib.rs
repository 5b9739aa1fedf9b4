//! # canopy-db: Database Layer for Canopy
//!
//! SQLite storage behind narrow repository contracts. Both the cloud relay
//! and the edge agent embed the same schema and use the parts they need.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Canopy Data Flow                                 │
//! │                                                                         │
//! │  cloud: liveness pass, inbound router, command forwarder               │
//! │  edge:  controller audit, sampler, daily sync                          │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     canopy-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │◄───│ sites, alarms │    │  (embedded)  │  │   │
//! │  │   │  SqlitePool   │    │ commands, ... │    │ 001_init.sql │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use canopy_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("cloud.db")).await?;
//! let advanced = db.sites().touch_last_contact("farm-01", now).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::alarm::AlarmRepository;
pub use repository::command::CommandRepository;
pub use repository::config::{EdgeConfigRepository, StoredConfig};
pub use repository::reading::ReadingRepository;
pub use repository::site::{GrantRepository, SiteRepository};
pub use repository::summary::SummaryRepository;
