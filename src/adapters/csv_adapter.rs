//! CSV bar source.
//!
//! One file per symbol and timeframe, `{data_dir}/{SYMBOL}_{tf}.csv`, with
//! header `open_time,open,high,low,close,volume` followed by any number of
//! extra numeric columns (precomputed indicators). `open_time` is RFC 3339
//! or epoch milliseconds.
//!
//! Parsed files are kept until their modification time changes, so the
//! history read and the last-bar read of one step share a single parse.

use crate::domain::bar::Bar;
use crate::domain::error::CascadeError;
use crate::domain::timeframe::Timeframe;
use crate::ports::bar_port::BarSource;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

const CORE_COLUMNS: [&str; 6] = ["open_time", "open", "high", "low", "close", "volume"];

type ParsedFile = (SystemTime, Arc<Vec<Bar>>);

pub struct CsvBarSource {
    base_path: PathBuf,
    parsed: Mutex<HashMap<(String, Timeframe), ParsedFile>>,
}

impl CsvBarSource {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            parsed: Mutex::new(HashMap::new()),
        }
    }

    fn parsed(&self) -> MutexGuard<'_, HashMap<(String, Timeframe), ParsedFile>> {
        self.parsed.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn csv_path(&self, symbol: &str, timeframe: Timeframe) -> PathBuf {
        self.base_path.join(format!("{symbol}_{timeframe}.csv"))
    }

    /// Every bar in the file, ascending. A missing file is an empty history.
    fn load(&self, symbol: &str, timeframe: Timeframe) -> Result<Arc<Vec<Bar>>, CascadeError> {
        let path = self.csv_path(symbol, timeframe);
        let key = (symbol.to_string(), timeframe);
        let modified = match fs::metadata(&path) {
            Ok(meta) => meta.modified().ok(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("no bar file at {}", path.display());
                self.parsed().remove(&key);
                return Ok(Arc::new(Vec::new()));
            }
            Err(e) => {
                return Err(CascadeError::DataSource {
                    reason: format!("failed to stat {}: {e}", path.display()),
                });
            }
        };

        if let Some(modified) = modified {
            let parsed = self.parsed();
            if let Some((seen, bars)) = parsed.get(&key)
                && *seen == modified
            {
                log::trace!("reusing parsed {}", path.display());
                return Ok(Arc::clone(bars));
            }
        }

        let bars = Arc::new(parse_file(&path, symbol, timeframe)?);
        if let Some(modified) = modified {
            self.parsed().insert(key, (modified, Arc::clone(&bars)));
        }
        Ok(bars)
    }
}

fn parse_file(path: &Path, symbol: &str, timeframe: Timeframe) -> Result<Vec<Bar>, CascadeError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            log::debug!("no bar file at {}", path.display());
            return Ok(Vec::new());
        }
        Err(e) => {
            return Err(CascadeError::DataSource {
                reason: format!("failed to read {}: {e}", path.display()),
            });
        }
    };

    let mut rdr = csv::Reader::from_reader(content.as_bytes());
    let headers: Vec<String> = rdr
        .headers()
        .map_err(|e| data_error(path, format!("CSV header error: {e}")))?
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();
    if headers.len() < CORE_COLUMNS.len()
        || headers.iter().zip(CORE_COLUMNS).any(|(h, c)| h != c)
    {
        return Err(data_error(
            path,
            format!("header must start with {}", CORE_COLUMNS.join(",")),
        ));
    }

    let mut bars = Vec::new();
    for (line, result) in rdr.records().enumerate() {
        let record = result.map_err(|e| data_error(path, format!("CSV parse error: {e}")))?;
        let field = |i: usize| -> Result<f64, CascadeError> {
            let raw = record.get(i).map(str::trim).unwrap_or("");
            raw.parse().map_err(|_| {
                data_error(
                    path,
                    format!("row {}: invalid {} value '{raw}'", line + 1, headers[i]),
                )
            })
        };

        let raw_time = record.get(0).map(str::trim).unwrap_or("");
        let open_time = parse_open_time(raw_time).ok_or_else(|| {
            data_error(path, format!("row {}: invalid open_time '{raw_time}'", line + 1))
        })?;

        let mut extras = BTreeMap::new();
        for i in CORE_COLUMNS.len()..headers.len() {
            if record.get(i).is_some_and(|v| !v.trim().is_empty()) {
                extras.insert(headers[i].clone(), field(i)?);
            }
        }

        bars.push(Bar {
            symbol: symbol.to_string(),
            timeframe,
            open_time,
            open: field(1)?,
            high: field(2)?,
            low: field(3)?,
            close: field(4)?,
            volume: field(5)?,
            extras,
        });
    }

    bars.sort_by_key(|b| b.open_time);
    Ok(bars)
}

fn data_error(path: &Path, reason: String) -> CascadeError {
    CascadeError::DataSource {
        reason: format!("{}: {reason}", path.display()),
    }
}

fn parse_open_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ms) = raw.parse::<i64>() {
        return Utc.timestamp_millis_opt(ms).single();
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

impl BarSource for CsvBarSource {
    fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, CascadeError> {
        let bars = self.load(symbol, timeframe)?;
        let skip = bars.len().saturating_sub(limit);
        Ok(bars[skip..].to_vec())
    }

    fn get_last_bar(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<Bar>, CascadeError> {
        Ok(self.load(symbol, timeframe)?.last().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn setup(name: &str, content: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        let mut f = File::create(dir.path().join(name)).unwrap();
        write!(f, "{content}").unwrap();
        dir
    }

    const SAMPLE: &str = "\
open_time,open,high,low,close,volume,rsi,ema_50
2024-01-01T02:00:00Z,102,103,101,102.5,900,58.1,100.2
1704067200000,100,101,99,100.5,1000,55,
2024-01-01T01:00:00Z,101,102,100,101.5,950,56.4,100.1
";

    #[test]
    fn reads_sorted_bars_with_extras() {
        let dir = setup("BTCUSDT_1h.csv", SAMPLE);
        let src = CsvBarSource::new(dir.path());
        let bars = src.get_bars("BTCUSDT", Timeframe::H1, 10).unwrap();
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].open_time.to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert_eq!(bars[0].extras.get("rsi"), Some(&55.0));
        assert!(!bars[0].extras.contains_key("ema_50"));
        assert_eq!(bars[2].extras["ema_50"], 100.2);
        assert_eq!(bars[2].timeframe, Timeframe::H1);
    }

    #[test]
    fn limit_keeps_most_recent() {
        let dir = setup("BTCUSDT_1h.csv", SAMPLE);
        let src = CsvBarSource::new(dir.path());
        let bars = src.get_bars("BTCUSDT", Timeframe::H1, 2).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].close, 102.5);
        let last = src.get_last_bar("BTCUSDT", Timeframe::H1).unwrap().unwrap();
        assert_eq!(last.close, 102.5);
    }

    #[test]
    fn missing_file_is_empty_history() {
        let dir = TempDir::new().unwrap();
        let src = CsvBarSource::new(dir.path());
        assert!(src.get_bars("ETHUSDT", Timeframe::M5, 50).unwrap().is_empty());
        assert!(src.get_last_bar("ETHUSDT", Timeframe::M5).unwrap().is_none());
    }

    #[test]
    fn bad_header_is_a_data_source_error() {
        let dir = setup("BTCUSDT_4h.csv", "date,open,high,low,close,volume\n");
        let src = CsvBarSource::new(dir.path());
        let err = src.get_bars("BTCUSDT", Timeframe::H4, 5).unwrap_err();
        assert!(matches!(err, CascadeError::DataSource { .. }));
    }

    #[test]
    fn bad_value_names_row_and_column() {
        let dir = setup(
            "BTCUSDT_4h.csv",
            "open_time,open,high,low,close,volume\n2024-01-01T00:00:00Z,1,2,0.5,abc,10\n",
        );
        let src = CsvBarSource::new(dir.path());
        let err = src.get_bars("BTCUSDT", Timeframe::H4, 5).unwrap_err().to_string();
        assert!(err.contains("row 1: invalid close value 'abc'"), "{err}");
    }

    #[test]
    fn unchanged_file_is_parsed_once() {
        let dir = setup("BTCUSDT_1h.csv", SAMPLE);
        let path = dir.path().join("BTCUSDT_1h.csv");
        let src = CsvBarSource::new(dir.path());
        assert_eq!(src.get_bars("BTCUSDT", Timeframe::H1, 10).unwrap().len(), 3);

        // same mtime: the earlier parse is served even though the bytes changed
        let stamp = fs::metadata(&path).unwrap().modified().unwrap();
        fs::write(&path, "date,open,high,low,close,volume\n").unwrap();
        File::options().write(true).open(&path).unwrap().set_modified(stamp).unwrap();
        let last = src.get_last_bar("BTCUSDT", Timeframe::H1).unwrap().unwrap();
        assert_eq!(last.close, 102.5);

        // a newer mtime forces a re-read
        let later = stamp + std::time::Duration::from_secs(60);
        File::options().write(true).open(&path).unwrap().set_modified(later).unwrap();
        let err = src.get_bars("BTCUSDT", Timeframe::H1, 10).unwrap_err();
        assert!(matches!(err, CascadeError::DataSource { .. }));
    }

    #[test]
    fn removed_file_drops_the_cached_history() {
        let dir = setup("BTCUSDT_1h.csv", SAMPLE);
        let src = CsvBarSource::new(dir.path());
        assert!(src.get_last_bar("BTCUSDT", Timeframe::H1).unwrap().is_some());

        fs::remove_file(dir.path().join("BTCUSDT_1h.csv")).unwrap();
        assert!(src.get_bars("BTCUSDT", Timeframe::H1, 10).unwrap().is_empty());
    }
}
