//! Per-timeframe validation step.

use crate::domain::condition;
use crate::domain::error::CascadeError;
use crate::domain::result::{KnownSignal, SignalSide, TimeframeResult, reason};
use crate::domain::rulebook::{DEFAULT_MIN_BARS, RuleBook};
use crate::domain::timeframe::Timeframe;
use crate::ports::bar_port::BarSource;
use crate::ports::indicator_port::{ContextOptions, IndicatorBuilder};
use crate::ports::kill_switch_port::KillSwitchStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Per-run bypass switches supplied by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunFlags {
    /// Bypass the freshness check, the kill switch and the grace window.
    pub force_run: bool,
    /// Bypass the freshness check only.
    pub force_timeframe_check: bool,
}

impl RunFlags {
    fn skip_freshness(self) -> bool {
        self.force_run || self.force_timeframe_check
    }
}

/// Everything a processor reads about the enclosing run.
#[derive(Debug, Clone, Copy)]
pub struct ProcessContext<'a> {
    pub run_id: Uuid,
    pub now: DateTime<Utc>,
    pub prior: &'a [KnownSignal],
    pub flags: RunFlags,
    pub rules: &'a RuleBook,
}

pub trait TimeframeProcessor: Send + Sync {
    fn timeframe(&self) -> Timeframe;

    /// Never fails: internal errors come back as an ERROR result.
    fn process(&self, symbol: &str, ctx: &ProcessContext<'_>) -> TimeframeResult;
}

/// Rule-driven processor backed by the bar, indicator and kill-switch ports.
pub struct RuleTimeframeProcessor {
    timeframe: Timeframe,
    bars: Arc<dyn BarSource>,
    indicators: Arc<dyn IndicatorBuilder>,
    kill_switch: Arc<dyn KillSwitchStore>,
}

impl RuleTimeframeProcessor {
    pub fn new(
        timeframe: Timeframe,
        bars: Arc<dyn BarSource>,
        indicators: Arc<dyn IndicatorBuilder>,
        kill_switch: Arc<dyn KillSwitchStore>,
    ) -> Self {
        Self {
            timeframe,
            bars,
            indicators,
            kill_switch,
        }
    }

    /// One processor per timeframe, all sharing the same collaborators.
    pub fn for_all(
        bars: Arc<dyn BarSource>,
        indicators: Arc<dyn IndicatorBuilder>,
        kill_switch: Arc<dyn KillSwitchStore>,
    ) -> Vec<Arc<dyn TimeframeProcessor>> {
        Timeframe::ALL
            .iter()
            .map(|tf| {
                Arc::new(Self::new(
                    *tf,
                    Arc::clone(&bars),
                    Arc::clone(&indicators),
                    Arc::clone(&kill_switch),
                )) as Arc<dyn TimeframeProcessor>
            })
            .collect()
    }

    fn try_process(
        &self,
        symbol: &str,
        ctx: &ProcessContext<'_>,
    ) -> Result<TimeframeResult, CascadeError> {
        let tf = self.timeframe;
        let rules = ctx.rules.timeframe(tf);
        let min_bars = rules.map_or(DEFAULT_MIN_BARS, |r| r.min_bars);

        let bars = self.bars.get_bars(symbol, tf, min_bars)?;
        if bars.len() < min_bars {
            let shortfall = (min_bars - bars.len()) as i32;
            self.kill_switch
                .disable_for(symbol, tf.step() * shortfall, ctx.now);
            log::debug!(
                "{symbol} {tf}: {} of {min_bars} bars, disabled for {shortfall} steps",
                bars.len()
            );
            return Ok(TimeframeResult::skipped(tf, reason::INSUFFICIENT_DATA));
        }

        let last = match self.bars.get_last_bar(symbol, tf)? {
            Some(bar) => bar,
            None => match bars.last() {
                Some(bar) => bar.clone(),
                None => return Ok(TimeframeResult::skipped(tf, reason::INSUFFICIENT_DATA)),
            },
        };
        if !ctx.flags.skip_freshness() && !last.is_closed_at(ctx.now) {
            log::debug!("{symbol} {tf}: last bar {} not closed", last.open_time);
            return Ok(TimeframeResult::skipped(tf, reason::TOO_RECENT));
        }

        if !ctx.flags.force_run && !self.kill_switch.can_process(symbol, tf, ctx.now) {
            return Ok(TimeframeResult::skipped(tf, reason::KILL_SWITCH_OFF));
        }

        if !ctx.flags.force_run {
            let grace = rules.map(|r| r.grace_window).unwrap_or_default();
            if grace > chrono::Duration::zero() && ctx.now - tf.bar_open(ctx.now) < grace {
                return Ok(TimeframeResult::grace_window(tf));
            }
        }

        let options = ContextOptions {
            run_id: Some(ctx.run_id),
            known_signals: ctx.prior.to_vec(),
        };
        let context = self
            .indicators
            .build_context(symbol, tf, &bars, &options)?;

        let mut result = match rules.filter(|r| !r.is_empty()) {
            None => TimeframeResult::invalid(tf, reason::NO_RULES_CONFIGURED),
            Some(rules) => {
                let long = ctx.rules.evaluate_list(&rules.long, &context);
                let short = ctx.rules.evaluate_list(&rules.short, &context);
                let long_results = long.iter().map(|l| &l.result);
                let short_results = short.iter().map(|l| &l.result);
                let decided = condition::ConditionResult::decided_count(long_results.clone())
                    + condition::ConditionResult::decided_count(short_results.clone());
                let mut r = if decided == 0 {
                    TimeframeResult::invalid(tf, reason::UNDECIDED_MISSING_DATA)
                } else {
                    let side = SignalSide::resolve(
                        condition::all_passed(long_results),
                        condition::all_passed(short_results),
                    );
                    TimeframeResult::valid(tf, side)
                };
                r.conditions_long = long;
                r.conditions_short = short;
                r
            }
        };
        result.kline_time = Some(last.open_time);
        result.current_price = context.number("close").or(Some(last.close));
        result.atr = context.number("atr");
        result.context = Some(Arc::new(context));
        Ok(result)
    }
}

impl TimeframeProcessor for RuleTimeframeProcessor {
    fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    fn process(&self, symbol: &str, ctx: &ProcessContext<'_>) -> TimeframeResult {
        match self.try_process(symbol, ctx) {
            Ok(result) => result,
            Err(e) => {
                log::error!("{symbol} {}: {e}", self.timeframe);
                TimeframeResult::error(self.timeframe, e.to_string())
            }
        }
    }
}
