pub mod orchestrator;
pub mod outcome;
pub mod xray;

use std::sync::Arc;

use async_trait::async_trait;

use crate::descriptor::EndpointDescriptor;

pub use orchestrator::{ProbePolicy, StagedProber};
pub use outcome::{AppCheck, ProbeOutcome};
pub use xray::XrayProber;

/// Produces exactly one outcome per call; failures are outcomes, not errors.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, index: usize, endpoint: Arc<EndpointDescriptor>) -> ProbeOutcome;
}
