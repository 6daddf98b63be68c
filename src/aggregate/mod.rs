use std::collections::BTreeMap;
use std::fmt;

use crate::probe::ProbeOutcome;

/// One line of the ranked output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedResult {
    pub raw_text: String,
    pub total_latency_ms: u64,
}

impl fmt::Display for RankedResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}  # latency={}ms", self.raw_text, self.total_latency_ms)
    }
}

/// Keep successful outcomes within the ceiling, fastest first.
///
/// Equal latencies keep input order, so the ranking does not depend on the
/// order probes happened to complete in.
pub fn aggregate(
    outcomes: &[ProbeOutcome],
    latency_ceiling_ms: u64,
    top_n: Option<usize>,
) -> Vec<RankedResult> {
    let mut survivors: Vec<&ProbeOutcome> = outcomes
        .iter()
        .filter(|o| o.succeeded && o.total_latency_ms <= latency_ceiling_ms)
        .collect();
    survivors.sort_by_key(|o| (o.total_latency_ms, o.index));

    if let Some(n) = top_n {
        survivors.truncate(n);
    }

    survivors
        .into_iter()
        .map(|o| RankedResult {
            raw_text: o.endpoint.raw_text.clone(),
            total_latency_ms: o.total_latency_ms,
        })
        .collect()
}

/// Output file contents, one result per line.
pub fn render(results: &[RankedResult]) -> String {
    results.iter().map(|r| format!("{r}\n")).collect()
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    /// Failure count per `StageFailure::kind`.
    pub failures: BTreeMap<&'static str, usize>,
}

pub fn summarize(outcomes: &[ProbeOutcome]) -> BatchSummary {
    let mut summary = BatchSummary {
        total: outcomes.len(),
        ..Default::default()
    };
    for outcome in outcomes {
        match &outcome.failure_reason {
            None => summary.succeeded += 1,
            Some(reason) => *summary.failures.entry(reason.kind()).or_default() += 1,
        }
    }
    summary
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} endpoints alive", self.succeeded, self.total)?;
        for (kind, count) in &self.failures {
            write!(f, ", {kind}={count}")?;
        }
        Ok(())
    }
}
