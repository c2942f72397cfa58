//! Core identifiers and utilities for switchyard.
//!
//! This crate provides the strongly-typed identifiers and the error-handling
//! foundation shared by the credential vault, the health monitor and the
//! server.

pub mod duration;
pub mod error;
pub mod id;

pub use error::Result;
pub use id::{AuditEntryId, IntegrationId, OwnerId, ParseIdError};
