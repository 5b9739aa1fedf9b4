//! # Repository Module
//!
//! Narrow read/write contracts used by the relay. Each repository is a cheap
//! clone of the pool, obtained from [`crate::Database`].
//!
//! ## Available Repositories
//!
//! | Repository | Tier | Writes |
//! |---|---|---|
//! | [`site::SiteRepository`] | cloud | `last_contact_at`, `status` |
//! | [`site::GrantRepository`] | cloud | per-site view grants |
//! | [`command::CommandRepository`] | both | append-only audit |
//! | [`alarm::AlarmRepository`] | both | episode create/resolve |
//! | [`summary::SummaryRepository`] | both | runs, roll-ups, sync marks |
//! | [`reading::ReadingRepository`] | edge | sensor time series |
//! | [`config::EdgeConfigRepository`] | edge | program config document |

pub mod alarm;
pub mod command;
pub mod config;
pub mod reading;
pub mod site;
pub mod summary;
