use chrono::{Duration, NaiveDate};
use evotrader::prepare::normalize_raw_csv;
use evotrader::{
    ChannelObserver, CheckpointStore, EngineError, SimulationConfig, SimulationEngine, StopReason,
};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("evotrader-it-{}", uuid::Uuid::new_v4()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Raw export covering 2020-06-01 .. 2022-06-01, one row every 3 days,
/// newest first the way the price source publishes it.
fn write_raw_export(path: &Path) {
    let mut raw = String::from("Date,Fear_Greed,Price\n");
    let mut date = ymd(2022, 6, 1);
    let mut step = 0u32;
    while date >= ymd(2020, 6, 1) {
        let price = 20_000.0 + 5_000.0 * ((step as f64) / 9.0).sin() + 10.0 * step as f64;
        let fear_greed = 20 + (step * 7) % 60;
        writeln!(
            raw,
            "\"{}\",{},\"{}\"",
            date.format("%d %b, %Y"),
            fear_greed,
            format_thousands(price)
        )
        .unwrap();
        date -= Duration::days(3);
        step += 1;
    }
    fs::write(path, raw).unwrap();
}

fn format_thousands(price: f64) -> String {
    let whole = price.trunc() as u64;
    let cents = ((price.fract()) * 100.0).round() as u64 % 100;
    let digits = whole.to_string();
    let mut out = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    format!("{out}.{cents:02}")
}

fn config(dataset: &Path, save_dir: &Path) -> SimulationConfig {
    let mut config = SimulationConfig::new(dataset, ymd(2021, 1, 1), ymd(2021, 12, 31), save_dir);
    config.population_size = 12;
    config.survival_rate = 0.25;
    config.save_interval = 2;
    config.seed = Some(2021);
    config.max_concurrency = 2;
    config
}

#[test]
fn normalize_run_and_resume() {
    let dir = scratch_dir();
    let raw = dir.join("raw.csv");
    let normalized = dir.join("normalized.csv");
    let save_dir = dir.join("run");
    write_raw_export(&raw);
    let rows = normalize_raw_csv(&raw, &normalized, 2020, 2023).unwrap();
    assert!(rows > 200);

    let config = config(&normalized, &save_dir);
    config.save(&save_dir).unwrap();

    let mut engine = SimulationEngine::start(config.clone()).unwrap();
    assert!(engine
        .dataset()
        .ticks()
        .iter()
        .all(|t| t.date >= ymd(2021, 1, 1) && t.date <= ymd(2021, 12, 31)));
    assert!(engine.dataset().ticks().windows(2).all(|w| w[0].date < w[1].date));

    let (observer, receiver) = ChannelObserver::new();
    engine.add_observer(Box::new(observer));
    let summary = engine.run(&AtomicBool::new(false), Some(3)).unwrap();
    assert_eq!(summary.stop_reason, StopReason::GenerationLimit);
    assert_eq!(summary.next_generation, 3);

    let reports: Vec<_> = receiver.try_iter().collect();
    assert_eq!(reports.len(), 3);
    for report in &reports {
        let stats = report.statistics;
        assert!(stats.best_wealth >= stats.average_wealth);
        assert!(stats.average_wealth >= stats.worst_wealth);
        assert!(stats.worst_wealth >= 0.0);
        // The best agent's history covers every tick plus the liquidation.
        assert_eq!(report.best_agent_history.len(), engine.dataset().len() + 1);
    }
    drop(engine);

    // Resuming from the persisted config continues at the stored counter.
    let reloaded = SimulationConfig::load(&save_dir).unwrap();
    assert_eq!(reloaded, config);
    let mut resumed = SimulationEngine::start(reloaded).unwrap();
    assert_eq!(resumed.generation(), 3);
    assert_eq!(resumed.population().len(), 12);
    let summary = resumed.run(&AtomicBool::new(false), Some(1)).unwrap();
    assert_eq!(summary.next_generation, 4);
    assert_eq!(
        CheckpointStore::new(config.checkpoint_path()).load().unwrap().generation,
        4
    );

    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn missing_dataset_fails_before_any_generation() {
    let dir = scratch_dir();
    let save_dir = dir.join("run");
    let config = config(&dir.join("absent.csv"), &save_dir);
    assert!(matches!(
        SimulationEngine::start(config.clone()),
        Err(EngineError::Dataset(_))
    ));
    assert!(!CheckpointStore::new(config.checkpoint_path()).exists());
    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn invalid_config_never_starts() {
    let dir = scratch_dir();
    let mut config = config(&dir.join("absent.csv"), &dir.join("run"));
    config.survival_rate = 0.05;
    assert!(matches!(
        SimulationEngine::start(config),
        Err(EngineError::Config(_))
    ));
    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn resume_without_checkpoint_is_an_error() {
    let dir = scratch_dir();
    let raw = dir.join("raw.csv");
    let dataset = dir.join("normalized.csv");
    write_raw_export(&raw);
    normalize_raw_csv(&raw, &dataset, 2020, 2023).unwrap();
    let config = config(&dataset, &dir.join("run"));

    SimulationEngine::start(config.clone()).unwrap();
    fs::remove_file(config.checkpoint_path()).unwrap();
    match SimulationEngine::resume(config.clone()) {
        Err(EngineError::MissingCheckpoint(path)) => assert_eq!(path, config.checkpoint_path()),
        other => panic!("expected a missing checkpoint error, got {:?}", other.map(|_| ())),
    }
    fs::remove_dir_all(dir).unwrap();
}
