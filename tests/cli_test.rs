//! Binary-level tests over real files on disk.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;
use tfcascade::domain::timeframe::Timeframe;

const NOW: &str = "2024-03-01T12:00:30Z";

const RULES: &str = r#"{
  "rules": {
    "momentum_up": {"all_of": ["rsi_bullish", {"adx_trending": 25}]},
    "momentum_down": {"all_of": ["rsi_bearish", {"adx_trending": 25}]}
  },
  "validation": {
    "start_from_timeframe": "4h",
    "timeframe": {
      "4h": {"long": ["momentum_up"], "short": ["momentum_down"], "min_bars": 5},
      "1h": {"long": ["momentum_up"], "short": ["momentum_down"], "min_bars": 5},
      "15m": {"long": ["rsi_bullish"], "short": ["rsi_bearish"], "min_bars": 5},
      "5m": {"long": ["rsi_bullish"], "short": ["rsi_bearish"], "min_bars": 5},
      "1m": {"long": ["rsi_bullish"], "short": ["rsi_bearish"], "min_bars": 5}
    }
  },
  "execution_selector": {
    "per_timeframe": {"15m": {"stay_on_if": ["adx_trending"]}}
  }
}"#;

fn bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_tfcascade"))
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 30).unwrap()
}

/// Ten closed bars per timeframe with `rsi` and `adx` columns.
fn write_bars(dir: &Path, symbol: &str) {
    for tf in Timeframe::ALL {
        let last_open = tf.bar_open(now()) - tf.step();
        let mut csv = String::from("open_time,open,high,low,close,volume,rsi,adx\n");
        for i in (0..10).rev() {
            let t = last_open - tf.step() * i;
            csv.push_str(&format!(
                "{},100,101,99,100.5,1000,61.5,33\n",
                t.timestamp_millis()
            ));
        }
        fs::write(dir.join(format!("{symbol}_{tf}.csv")), csv).unwrap();
    }
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

#[test]
fn conditions_lists_builtins() {
    let out = bin().arg("conditions").output().unwrap();
    assert!(out.status.success());
    let listed = stdout(&out);
    for name in ["rsi_bullish", "liquidity_ok", "close_below_vwap"] {
        assert!(listed.lines().any(|l| l == name), "{name} missing");
    }
}

#[test]
fn validate_accepts_good_rules() {
    let dir = TempDir::new().unwrap();
    let rules = dir.path().join("rules.json");
    fs::write(&rules, RULES).unwrap();

    let out = bin().args(["validate", "--rules"]).arg(&rules).output().unwrap();

    assert_eq!(out.status.code(), Some(0), "{}", stdout(&out));
    assert!(stdout(&out).contains("OK"));
}

#[test]
fn validate_rejects_cycle_with_exit_4() {
    let dir = TempDir::new().unwrap();
    let rules = dir.path().join("rules.toml");
    fs::write(
        &rules,
        r#"
[rules.a]
all_of = ["b"]

[rules.b]
any_of = ["a"]

[validation.timeframe.4h]
long = ["a"]
short = []
"#,
    )
    .unwrap();

    let out = bin()
        .args(["validate", "--json", "--rules"])
        .arg(&rules)
        .output()
        .unwrap();

    assert_eq!(out.status.code(), Some(4));
    let report: Value = serde_json::from_str(&stdout(&out)).unwrap();
    let kinds: Vec<&str> = report["errors"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["type"].as_str())
        .collect();
    assert!(kinds.contains(&"circular_reference"), "{kinds:?}");
}

#[test]
fn run_produces_ready_json_report() {
    let dir = TempDir::new().unwrap();
    let rules = dir.path().join("rules.json");
    fs::write(&rules, RULES).unwrap();
    write_bars(dir.path(), "BTCUSDT");

    let out = bin()
        .args(["run", "--json", "--symbols", "btcusdt", "--now", NOW, "--rules"])
        .arg(&rules)
        .arg("--data-dir")
        .arg(dir.path())
        .output()
        .unwrap();

    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let value: Value = serde_json::from_str(&stdout(&out)).unwrap();
    let report = &value["reports"][0];
    assert_eq!(report["result"]["symbol"], "BTCUSDT");
    assert_eq!(report["result"]["status"], "READY");
    assert_eq!(report["result"]["signalSide"], "LONG");
    assert_eq!(report["result"]["executionTf"], "15m");
    assert_eq!(report["decision"]["reason"], "15m.stay_on_if");
    // five steps plus the result record
    assert_eq!(value["audit"].as_array().unwrap().len(), 6);
}

#[test]
fn settings_kill_switch_skips_the_run() {
    let dir = TempDir::new().unwrap();
    let rules = dir.path().join("rules.json");
    fs::write(&rules, RULES).unwrap();
    write_bars(dir.path(), "BTCUSDT");
    let settings = dir.path().join("settings.ini");
    fs::write(
        &settings,
        format!(
            "[engine]\ndata_dir = {}\nworkers = 2\n\n[kill_switch]\noff = BTCUSDT:1h\n",
            dir.path().display()
        ),
    )
    .unwrap();

    let out = bin()
        .args(["run", "--symbols", "BTCUSDT", "--now", NOW, "--rules"])
        .arg(&rules)
        .arg("--settings")
        .arg(&settings)
        .output()
        .unwrap();

    assert!(out.status.success());
    let line = stdout(&out);
    assert!(line.starts_with("BTCUSDT SKIPPED"), "{line}");
    assert!(line.contains("failed=1h"));
    assert!(line.contains("reason=KILL_SWITCH_OFF"));
}

#[test]
fn run_without_data_dir_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let rules = dir.path().join("rules.json");
    fs::write(&rules, RULES).unwrap();

    let out = bin()
        .args(["run", "--symbols", "BTCUSDT", "--rules"])
        .arg(&rules)
        .output()
        .unwrap();

    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn run_rejects_duplicate_symbols() {
    let dir = TempDir::new().unwrap();
    let rules = dir.path().join("rules.json");
    fs::write(&rules, RULES).unwrap();

    let out = bin()
        .args(["run", "--symbols", "BTCUSDT,btcusdt", "--rules"])
        .arg(&rules)
        .arg("--data-dir")
        .arg(dir.path())
        .output()
        .unwrap();

    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stderr).contains("duplicate symbol"));
}
