//! Per-pane aggregation of cost/token metrics.

use std::collections::HashMap;

use termdeck_core::types::{CostMetric, CostTotals, TokenBreakdown};

/// Running cost totals per pane, fed by the OTLP receiver.
#[derive(Debug, Default)]
pub struct CostAggregator {
    totals: HashMap<String, CostTotals>,
}

impl CostAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one batch-level metric into the pane's running totals and
    /// return the updated totals.
    pub fn ingest(&mut self, metric: &CostMetric) -> CostTotals {
        let entry = self
            .totals
            .entry(metric.pane_id.clone())
            .or_insert_with(|| CostTotals {
                total_cost_usd: 0.0,
                total_tokens: TokenBreakdown::default(),
                metric_count: 0,
                first_at: metric.timestamp,
                last_at: metric.timestamp,
            });

        entry.total_cost_usd += metric.cost_usd;
        entry.total_tokens.input += metric.input_tokens;
        entry.total_tokens.output += metric.output_tokens;
        entry.total_tokens.cache_read += metric.cache_read_tokens;
        entry.total_tokens.cache_write += metric.cache_write_tokens;
        entry.metric_count += 1;
        if metric.timestamp < entry.first_at {
            entry.first_at = metric.timestamp;
        }
        if metric.timestamp > entry.last_at {
            entry.last_at = metric.timestamp;
        }

        entry.clone()
    }

    pub fn totals_for(&self, pane_id: &str) -> Option<&CostTotals> {
        self.totals.get(pane_id)
    }

    pub fn pane_count(&self) -> usize {
        self.totals.len()
    }
}
