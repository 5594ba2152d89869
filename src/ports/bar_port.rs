//! Bar source port.

use crate::domain::bar::Bar;
use crate::domain::error::CascadeError;
use crate::domain::timeframe::Timeframe;

pub trait BarSource: Send + Sync {
    /// Up to `limit` most recent bars, ascending by open time.
    fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, CascadeError>;

    fn get_last_bar(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<Bar>, CascadeError>;
}
