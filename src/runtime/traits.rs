//! Trait abstractions for runtime I/O
//!
//! These traits enable testing the executor with mock implementations.

use crate::error::TransportError;
use crate::protocol::{ClientEvent, ToolDefinition};
use crate::tools::{Tool, ToolRegistry};
use async_trait::async_trait;
use std::sync::Arc;

/// Outbound half of the server connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one event; fails once the connection is gone.
    async fn send(&self, event: &ClientEvent) -> Result<(), TransportError>;
}

/// Looks up tool handlers by function name
pub trait ToolResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Tool>>;

    /// Definitions advertised in `session.update`
    fn definitions(&self) -> Vec<ToolDefinition>;
}

impl ToolResolver for ToolRegistry {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Tool>> {
        ToolRegistry::resolve(self, name)
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        ToolRegistry::definitions(self)
    }
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, event: &ClientEvent) -> Result<(), TransportError> {
        (**self).send(event).await
    }
}

impl<T: ToolResolver + ?Sized> ToolResolver for Arc<T> {
    fn resolve(&self, name: &str) -> Option<Arc<dyn Tool>> {
        (**self).resolve(name)
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        (**self).definitions()
    }
}
