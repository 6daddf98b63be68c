use std::sync::Arc;

use crate::descriptor::EndpointDescriptor;
use crate::stage::{Stage, StageFailure};

/// What became of the soft application-layer check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppCheck {
    /// Not applicable to the transport, or disabled.
    Skipped,
    Passed { status: u16 },
    /// The check failed and was deliberately not held against the endpoint.
    Ignored { reason: StageFailure },
}

/// Result of probing one endpoint once.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    /// Position of the endpoint in the parsed input.
    pub index: usize,
    pub endpoint: Arc<EndpointDescriptor>,
    pub succeeded: bool,
    /// Sum of the gating stages; zero when the probe failed.
    pub total_latency_ms: u64,
    /// Latencies of the stages that completed, in execution order.
    pub stage_latencies: Vec<(Stage, u64)>,
    pub failure_reason: Option<StageFailure>,
    pub app_check: AppCheck,
    pub cert_validity_days: Option<i64>,
}

impl ProbeOutcome {
    pub fn success(
        index: usize,
        endpoint: Arc<EndpointDescriptor>,
        stage_latencies: Vec<(Stage, u64)>,
        app_check: AppCheck,
        cert_validity_days: Option<i64>,
    ) -> Self {
        let total_latency_ms = stage_latencies
            .iter()
            .filter(|(stage, _)| stage.counts_toward_total())
            .map(|(_, ms)| ms)
            .sum();

        Self {
            index,
            endpoint,
            succeeded: true,
            total_latency_ms,
            stage_latencies,
            failure_reason: None,
            app_check,
            cert_validity_days,
        }
    }

    pub fn failure(
        index: usize,
        endpoint: Arc<EndpointDescriptor>,
        stage_latencies: Vec<(Stage, u64)>,
        reason: StageFailure,
    ) -> Self {
        Self {
            index,
            endpoint,
            succeeded: false,
            total_latency_ms: 0,
            stage_latencies,
            failure_reason: Some(reason),
            app_check: AppCheck::Skipped,
            cert_validity_days: None,
        }
    }

    pub fn not_attempted(index: usize, endpoint: Arc<EndpointDescriptor>) -> Self {
        Self::failure(index, endpoint, Vec::new(), StageFailure::NotAttempted)
    }

    pub fn latency_of(&self, stage: Stage) -> Option<u64> {
        self.stage_latencies
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, ms)| *ms)
    }

    /// `connect=50ms tls=80ms`
    pub fn stage_breakdown(&self) -> String {
        self.stage_latencies
            .iter()
            .map(|(stage, ms)| format!("{}={}ms", stage.name(), ms))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
