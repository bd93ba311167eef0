use anyhow::Result;
use gpuscope_agent::output::StatsReport;
use gpuscope_agent::{Config, RunMode};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

const SEC: u64 = 1_000_000_000;

fn launch(pid: u32, stream_id: u64, ktime_ns: u64, threads: u32) -> String {
    format!(
        r#"{{"type":"kernel_launch","pid":{pid},"stream_id":{stream_id},"ktime_ns":{ktime_ns},"grid_size":{{"x":1,"y":1,"z":1}},"block_size":{{"x":{threads},"y":1,"z":1}}}}"#
    )
}

fn sync(pid: u32, stream_id: u64, ktime_ns: u64) -> String {
    format!(r#"{{"type":"sync","pid":{pid},"stream_id":{stream_id},"ktime_ns":{ktime_ns}}}"#)
}

fn mem(pid: u32, ktime_ns: u64, addr: u64, size: u64, kind: &str) -> String {
    format!(
        r#"{{"type":"memory","pid":{pid},"stream_id":0,"ktime_ns":{ktime_ns},"addr":{addr},"size":{size},"kind":"{kind}"}}"#
    )
}

fn write_log(lines: &[String]) -> Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    for line in lines {
        writeln!(file, "{}", line)?;
    }
    file.flush()?;
    Ok(file)
}

fn replay_config(input: &NamedTempFile, output: &NamedTempFile) -> Config {
    Config {
        interval: Duration::from_secs(1),
        device_max_threads: vec![100],
        mode: RunMode::Replay,
        input: Some(input.path().to_path_buf()),
        json_output: Some(output.path().to_path_buf()),
        ..Default::default()
    }
}

fn read_reports(output: &NamedTempFile) -> Result<Vec<StatsReport>> {
    let contents = std::fs::read_to_string(output.path())?;
    contents
        .lines()
        .map(|line| Ok(serde_json::from_str(line)?))
        .collect()
}

#[tokio::test]
async fn test_replay_pipeline() -> Result<()> {
    let input = write_log(&[
        "# two processes sharing one device".to_string(),
        launch(10, 0, 0, 100),
        launch(20, 0, 0, 100),
        mem(10, 0, 0x1000, 4096, "alloc"),
        mem(20, 100, 0x2000, 512, "alloc"),
        mem(20, 200, 0x2000, 0, "free"),
        sync(10, 0, SEC / 2),
        sync(20, 0, SEC / 2),
        "this line is not an event".to_string(),
        sync(10, 0, SEC + 1),
    ])?;
    let output = NamedTempFile::new()?;

    gpuscope_agent::run(replay_config(&input, &output)).await?;

    let reports = read_reports(&output)?;
    assert_eq!(reports.len(), 2);

    // First interval: both processes used the full device for half a second
    let first = &reports[0];
    assert_eq!(first.interval_ns, SEC as i64);
    let p10 = first.stats.pid_stats[&10];
    let p20 = first.stats.pid_stats[&20];
    assert!((p10.utilization_percentage - 0.5).abs() < 1e-9);
    assert!((p20.utilization_percentage - 0.5).abs() < 1e-9);
    assert_eq!(p10.current_memory_bytes, 4096);
    assert_eq!(p20.current_memory_bytes, 0);
    assert_eq!(p20.max_memory_bytes, 512);

    // End of log closes every stream; the live allocation becomes a leak
    let last = &reports[1];
    let p10 = last.stats.pid_stats[&10];
    assert_eq!(p10.utilization_percentage, 0.0);
    assert_eq!(p10.current_memory_bytes, 0);
    assert_eq!(p10.max_memory_bytes, 4096);

    Ok(())
}

#[tokio::test]
async fn test_replay_writes_metrics() -> Result<()> {
    let input = write_log(&[
        mem(1, 10, 0xdead, 0, "free"),
        launch(1, 0, 20, 32),
        sync(1, 0, 30),
    ])?;
    let output = NamedTempFile::new()?;
    let metrics = NamedTempFile::new()?;

    let mut config = replay_config(&input, &output);
    config.metrics_output = Some(metrics.path().to_path_buf());
    gpuscope_agent::run(config).await?;

    let text = std::fs::read_to_string(metrics.path())?;
    assert!(text.contains("gpuscope_orphan_frees_total"));
    assert!(text.contains("gpuscope_events_total"));

    assert_eq!(read_reports(&output)?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let config = Config {
        mode: RunMode::Replay,
        input: None,
        ..Default::default()
    };
    assert!(gpuscope_agent::run(config).await.is_err());
}
