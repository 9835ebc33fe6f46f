use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use scr_ldx::error::ErrorCategory;
use scr_ldx::ldx::{existing_tags, Document};
use scr_ldx::schema::FormRegistry;
use scr_ldx::storage::{self, Database, WATCH_DIRECTORY_KEY};
use scr_ldx::watcher::LdxWatcher;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

const INTAKE: &str = r#"{
    "form_name": "intake",
    "role": "electronic",
    "fields": [
        {"name": "coolant_temp", "label": "Coolant temperature", "type": "number", "unit": "C"},
        {"name": "sensor_offset", "label": "Sensor offset", "type": "number", "unit": "mV", "lookback": true},
        {"name": "notes", "label": "Notes", "type": "textarea"}
    ]
}"#;

const DAQ: &str = r#"{
    "form_name": "daq",
    "role": "DAQ",
    "fields": [
        {"name": "torque", "label": "Torque", "type": "text"},
        {"name": "tyre_temp", "label": "Tyre temp", "type": "number", "unit": "C", "validity_window": 600}
    ]
}"#;

const CHIEF: &str = r#"{
    "form_name": "chief",
    "role": "chief",
    "fields": [
        {"name": "torque", "label": "Torque", "type": "text"},
        {"name": "notes", "label": "Notes", "type": "textarea"}
    ]
}"#;

const LDX: &str = r#"<?xml version="1.0"?>
<LDXFile Locale="English_Australia.1252" DefaultLocale="C" Version="1.6">
  <Layers>
    <Details>
      <String Id="Total Laps" Value="12"/>
    </Details>
  </Layers>
</LDXFile>
"#;

struct Harness {
    _dir: TempDir,
    watch_dir: PathBuf,
    db: Arc<Database>,
    watcher: LdxWatcher,
}

fn harness() -> Result<Harness> {
    let dir = TempDir::new()?;
    let forms_dir = dir.path().join("forms");
    let watch_dir = dir.path().join("logger");
    std::fs::create_dir_all(&forms_dir)?;
    std::fs::create_dir_all(&watch_dir)?;
    std::fs::write(forms_dir.join("intake.json"), INTAKE)?;
    std::fs::write(forms_dir.join("daq.json"), DAQ)?;
    std::fs::write(forms_dir.join("chief.json"), CHIEF)?;

    let db = storage::open(&dir.path().join("data").join("app.db"))?;
    let forms = Arc::new(FormRegistry::load_dir(&forms_dir)?);
    let watcher = LdxWatcher::new(
        db.clone(),
        forms,
        Some(watch_dir.clone()),
        "ldx",
        Duration::from_millis(50),
    );

    Ok(Harness {
        _dir: dir,
        watch_dir,
        db,
        watcher,
    })
}

fn submit(db: &Database, form: &str, pairs: &[(&str, &str)]) -> Result<()> {
    let values: BTreeMap<String, Option<String>> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Some(v.to_string())))
        .collect();
    db.submit_values(form, &values, Some(1), Utc::now())?;
    Ok(())
}

fn tags(path: &Path) -> Result<std::collections::HashMap<String, Vec<String>>> {
    let doc = Document::parse(&std::fs::read_to_string(path)?)?;
    Ok(existing_tags(&doc.root))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn each_file_is_processed_once() -> Result<()> {
    let h = harness()?;
    submit(&h.db, "intake", &[("coolant_temp", "91.2"), ("notes", "dry track")])?;
    std::fs::write(h.watch_dir.join("run_01.ldx"), LDX)?;
    std::fs::write(h.watch_dir.join("run_02.ldx"), LDX)?;
    std::fs::write(h.watch_dir.join("readme.txt"), "ignored")?;

    let first = h.watcher.scan_once().await;
    assert_eq!(first.processed.len(), 2);
    assert!(first.failed.is_empty());
    assert_eq!(first.processed[0].injected, 2);

    let second = h.watcher.scan_once().await;
    assert!(second.processed.is_empty());
    assert_eq!(second.already_seen, 2);

    let written = std::fs::read_to_string(h.watch_dir.join("run_01.ldx"))?;
    assert!(written.contains(r#"<MathConstant Name="Coolant Temp" Value="91.2" Unit="C"/>"#));
    assert!(written.contains(r#"<String Id="Electronic.notes" Value="dry track"/>"#));

    let log = h.db.injections_for_file("run_01.ldx")?;
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|e| !e.was_update));

    let stats = h.db.injection_stats()?;
    let names: Vec<_> = stats.iter().map(|s| s.file_name.as_str()).collect();
    assert_eq!(names, vec!["run_01.ldx", "run_02.ldx"]);
    assert_eq!(stats[0].total, 2);
    assert_eq!(stats[0].static_count, 2);

    assert!(h.watcher.pending_files()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn shared_field_names_are_qualified() -> Result<()> {
    let h = harness()?;
    submit(&h.db, "daq", &[("torque", "41")])?;
    submit(&h.db, "chief", &[("torque", "40"), ("notes", "box lap 12")])?;
    let path = h.watch_dir.join("run.ldx");
    std::fs::write(&path, LDX)?;

    let report = h.watcher.scan_once().await;
    assert_eq!(report.processed.len(), 1);

    let tags = tags(&path)?;
    assert_eq!(tags["Daq Torque"], vec!["41"]);
    assert_eq!(tags["Chief Torque"], vec!["40"]);
    assert_eq!(tags["Chief.notes"], vec!["box lap 12"]);
    assert!(!tags.contains_key("Torque"));
    Ok(())
}

#[tokio::test]
async fn lookback_injects_previous_submission() -> Result<()> {
    let h = harness()?;
    let t0 = Utc::now() - ChronoDuration::seconds(30);
    let one = |v: &str| BTreeMap::from([("sensor_offset".to_string(), Some(v.to_string()))]);

    h.db.submit_values("intake", &one("12"), None, t0)?;
    let path = h.watch_dir.join("first.ldx");
    std::fs::write(&path, LDX)?;
    h.watcher.scan_once().await;
    assert!(!tags(&path)?.contains_key("Sensor Offset"));

    h.db.submit_values("intake", &one("14"), None, t0 + ChronoDuration::seconds(10))?;
    let path = h.watch_dir.join("second.ldx");
    std::fs::write(&path, LDX)?;
    h.watcher.scan_once().await;
    assert_eq!(tags(&path)?["Sensor Offset"], vec!["12"]);
    Ok(())
}

#[tokio::test]
async fn stale_values_are_not_injected() -> Result<()> {
    let h = harness()?;
    let values = BTreeMap::from([("tyre_temp".to_string(), Some("80".to_string()))]);
    h.db.submit_values("daq", &values, None, Utc::now() - ChronoDuration::seconds(601))?;
    submit(&h.db, "daq", &[("torque", "41")])?;

    let path = h.watch_dir.join("run.ldx");
    std::fs::write(&path, LDX)?;
    let report = h.watcher.scan_once().await;
    assert_eq!(report.processed[0].injected, 1);
    assert_eq!(report.processed[0].skipped, 1);

    let tags = tags(&path)?;
    assert!(tags.contains_key("Torque"));
    assert!(!tags.contains_key("Tyre Temp"));
    Ok(())
}

#[tokio::test]
async fn malformed_file_is_retried_until_fixed() -> Result<()> {
    let h = harness()?;
    submit(&h.db, "daq", &[("torque", "41")])?;
    let path = h.watch_dir.join("broken.ldx");
    std::fs::write(&path, "<LDXFile><Layers></LDXFile>")?;

    for _ in 0..2 {
        let report = h.watcher.scan_once().await;
        assert!(report.processed.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].category, ErrorCategory::MalformedTarget);
    }
    assert_eq!(h.watcher.pending_files()?.len(), 1);
    assert!(h.db.injections_for_file("broken.ldx")?.is_empty());

    std::fs::write(&path, LDX)?;
    let report = h.watcher.scan_once().await;
    assert_eq!(report.processed.len(), 1);
    assert!(h.watcher.pending_files()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn no_values_still_marks_processed() -> Result<()> {
    let h = harness()?;
    let path = h.watch_dir.join("empty.ldx");
    std::fs::write(&path, LDX)?;

    let report = h.watcher.scan_once().await;
    assert_eq!(report.processed.len(), 1);
    assert_eq!(report.processed[0].injected, 0);
    assert_eq!(std::fs::read_to_string(&path)?, LDX);

    submit(&h.db, "daq", &[("torque", "41")])?;
    let report = h.watcher.scan_once().await;
    assert_eq!(report.already_seen, 1);
    assert_eq!(std::fs::read_to_string(&path)?, LDX);
    Ok(())
}

#[tokio::test]
async fn purge_allows_reprocessing() -> Result<()> {
    let h = harness()?;
    submit(&h.db, "daq", &[("torque", "41")])?;
    std::fs::write(h.watch_dir.join("run.ldx"), LDX)?;
    h.watcher.scan_once().await;

    h.db.purge()?;
    submit(&h.db, "daq", &[("torque", "43")])?;
    let report = h.watcher.scan_once().await;
    assert_eq!(report.processed.len(), 1);

    // the file still holds Torque=41 from the first pass, so the new value is qualified
    let log = h.db.injections_for_file("run.ldx")?;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].field_id, "Daq Torque");
    assert!(!log[0].was_update);

    let tags = tags(&h.watch_dir.join("run.ldx"))?;
    assert_eq!(tags["Torque"], vec!["41"]);
    assert_eq!(tags["Daq Torque"], vec!["43"]);
    Ok(())
}

#[tokio::test]
async fn runtime_watch_directory_wins() -> Result<()> {
    let h = harness()?;
    let other = h.watch_dir.parent().unwrap().join("elsewhere");
    std::fs::create_dir_all(&other)?;
    std::fs::write(other.join("run.ldx"), LDX)?;
    std::fs::write(h.watch_dir.join("ignored.ldx"), LDX)?;

    h.db.set_setting(WATCH_DIRECTORY_KEY, &other.to_string_lossy())?;
    assert_eq!(h.watcher.watch_dir()?, Some(other.clone()));

    let report = h.watcher.scan_once().await;
    assert_eq!(report.directory, Some(other));
    assert_eq!(report.processed.len(), 1);
    Ok(())
}

#[tokio::test]
async fn missing_directory_is_a_quiet_noop() -> Result<()> {
    let h = harness()?;
    std::fs::remove_dir_all(&h.watch_dir)?;
    let report = h.watcher.scan_once().await;
    assert!(report.directory.is_none());
    assert!(report.processed.is_empty() && report.failed.is_empty());
    assert!(h.watcher.pending_files()?.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_loop_picks_up_new_files() -> Result<()> {
    let h = harness()?;
    submit(&h.db, "daq", &[("torque", "41")])?;

    h.watcher.start();
    h.watcher.start();
    assert!(h.watcher.is_running());

    let path = h.watch_dir.join("live.ldx");
    std::fs::write(&path, LDX)?;
    let key = std::fs::canonicalize(&path)?.to_string_lossy().into_owned();

    timeout(Duration::from_secs(5), async {
        while !h.db.is_processed(&key).unwrap_or(false) {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;

    h.watcher.stop().await;
    assert!(!h.watcher.is_running());
    assert!(tags(&path)?.contains_key("Torque"));
    Ok(())
}
