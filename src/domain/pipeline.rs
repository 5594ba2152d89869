//! Cascade plus execution selection for a batch of symbols.

use crate::domain::cascade::{CascadeOrchestrator, RunOptions};
use crate::domain::error::CascadeError;
use crate::domain::result::{SymbolResultDto, TimeframeResult};
use crate::domain::rulebook::RuleBookHandle;
use crate::domain::selector::{ExecutionDecision, ExecutionSelector, SelectorInput};
use rayon::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalReport {
    pub run_id: Uuid,
    pub result: SymbolResultDto,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<ExecutionDecision>,
    pub steps: Vec<TimeframeResult>,
}

pub struct SignalPipeline {
    orchestrator: CascadeOrchestrator,
    rules: Arc<RuleBookHandle>,
    workers: usize,
}

impl SignalPipeline {
    pub fn new(orchestrator: CascadeOrchestrator, rules: Arc<RuleBookHandle>, workers: usize) -> Self {
        Self {
            orchestrator,
            rules,
            workers: workers.max(1),
        }
    }

    /// One full cascade for `symbol` against a single rule-book snapshot.
    pub fn run_symbol(&self, symbol: &str, options: &RunOptions) -> SignalReport {
        let rules = self.rules.snapshot();
        let outcome = self.orchestrator.run(symbol, &rules, options);
        let mut result = outcome.result;

        let decision = match (result.is_ready(), result.signal_side, outcome.steps.last()) {
            (true, Some(side), Some(last)) => last.context.as_ref().map(|base| {
                let mut input = SelectorInput::new(side, Arc::clone(base));
                for step in &outcome.steps {
                    if let Some(ctx) = &step.context {
                        input.per_timeframe.insert(step.timeframe, Arc::clone(ctx));
                    }
                }
                ExecutionSelector::new(&rules).select(&input)
            }),
            _ => None,
        };

        if let Some(d) = &decision {
            match d.execution_timeframe.timeframe() {
                Some(tf) => {
                    log::info!("{symbol}: execution timeframe {tf} ({})", d.reason);
                    result.execution_tf = Some(tf);
                }
                None => {
                    log::info!("{symbol}: no execution timeframe ({})", d.reason);
                    result.execution_tf = None;
                }
            }
        }

        SignalReport {
            run_id: outcome.run_id,
            result,
            decision,
            steps: outcome.steps,
        }
    }

    /// Run every symbol on a private pool of `workers` threads; output keeps input order.
    pub fn run_all(
        &self,
        symbols: &[String],
        options: &RunOptions,
    ) -> Result<Vec<SignalReport>, CascadeError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| CascadeError::ConfigInvalid {
                section: "engine".into(),
                key: "workers".into(),
                reason: e.to_string(),
            })?;
        log::info!("running {} symbol(s) on {} worker(s)", symbols.len(), self.workers);
        Ok(pool.install(|| {
            symbols
                .par_iter()
                .map(|symbol| {
                    // Run ids stay unique per symbol even when the caller pins one.
                    let per_symbol = RunOptions {
                        run_id: options.run_id.filter(|_| symbols.len() == 1),
                        ..options.clone()
                    };
                    self.run_symbol(symbol, &per_symbol)
                })
                .collect()
        }))
    }
}
