//! Bundled connectors for the four supported integration kinds.
//!
//! Each connector builds a fresh HTTP client per probe, configured with the
//! timeout it is given. Remote rejections (401, 403, other non-success
//! statuses) are failed probes; transport failures are errors.

mod chat_platform;
mod deployment_controller;
mod generic_http;
mod http;
mod source_host;

pub use chat_platform::ChatPlatformConnector;
pub use deployment_controller::DeploymentControllerConnector;
pub use generic_http::GenericHttpConnector;
pub use source_host::SourceHostConnector;

use crate::connector::ConnectorDispatch;
use crate::registry::IntegrationKind;
use std::sync::Arc;

/// Registers every bundled connector under its kind.
pub fn register_bundled(dispatch: &ConnectorDispatch) {
    dispatch.register(
        IntegrationKind::DeploymentController,
        Arc::new(DeploymentControllerConnector),
    );
    dispatch.register(IntegrationKind::SourceHost, Arc::new(SourceHostConnector));
    dispatch.register(IntegrationKind::ChatPlatform, Arc::new(ChatPlatformConnector));
    dispatch.register(IntegrationKind::GenericHttp, Arc::new(GenericHttpConnector));
}
