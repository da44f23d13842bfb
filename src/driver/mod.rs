//! Automation driver capability
//!
//! The engine never recognizes UI elements itself. Every action, wait,
//! inspection and driver-side screenshot goes through a `Driver`, normally a
//! helper process attached to the editor's remote debugging port.

mod codec;
mod process;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::provision::EnvironmentHandle;
use crate::scenario::{ActionInstruction, Target, WaitState};

pub use codec::{read_message, write_message};
pub use process::{ProcessDriver, ProcessDriverConnector};

/// Errors reported by an automation driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The target is not (yet) in a usable state; worth retrying
    #[error("Target not ready: {0}")]
    Transient(String),

    #[error("Driver action failed: {0}")]
    Failed(String),

    #[error("Automation driver disconnected")]
    Disconnected,

    #[error("Driver protocol error: {0}")]
    Protocol(String),

    #[error("Failed to start automation driver: {0}")]
    Spawn(String),
}

impl DriverError {
    /// Whether the orchestrator may retry the step after this error
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Transient(_))
    }

    /// Whether the failure lies with the tooling rather than the editor
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            DriverError::Disconnected | DriverError::Protocol(_) | DriverError::Spawn(_)
        )
    }
}

/// What the driver observed about a target
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ElementSnapshot {
    /// Number of matching elements
    pub count: usize,
    /// Whether the first match is visible
    pub visible: bool,
    /// Text content of the first match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Automation driver bound to one environment
///
/// Methods take `&self` so the capture subsystem can request screenshots
/// while a step is in flight.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Perform a UI action, optionally on a target
    async fn perform(
        &self,
        action: &ActionInstruction,
        target: Option<&Target>,
    ) -> Result<(), DriverError>;

    /// Wait until the target reaches a state
    async fn wait_for(
        &self,
        target: &Target,
        state: WaitState,
        timeout: Duration,
    ) -> Result<(), DriverError>;

    /// Observe the target's current state
    async fn inspect(&self, target: &Target) -> Result<ElementSnapshot, DriverError>;

    /// Capture the editor window as PNG bytes
    async fn screenshot(&self, method: &str) -> Result<Vec<u8>, DriverError>;

    /// Detach from the editor
    async fn close(&self);
}

/// Creates drivers for provisioned environments
#[async_trait]
pub trait DriverConnector: Send + Sync {
    async fn connect(&self, env: &EnvironmentHandle) -> Result<Arc<dyn Driver>, DriverError>;
}
