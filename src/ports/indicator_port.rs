//! Indicator builder port.

use crate::domain::bar::Bar;
use crate::domain::context::EvaluationContext;
use crate::domain::error::CascadeError;
use crate::domain::result::KnownSignal;
use crate::domain::timeframe::Timeframe;
use uuid::Uuid;

/// Extra inputs for context construction.
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    pub run_id: Option<Uuid>,
    /// Results of timeframes already processed in this run, coarsest first.
    pub known_signals: Vec<KnownSignal>,
}

pub trait IndicatorBuilder: Send + Sync {
    fn build_context(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        bars: &[Bar],
        options: &ContextOptions,
    ) -> Result<EvaluationContext, CascadeError>;
}
