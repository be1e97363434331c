use anyhow::{Context, Result};
use hoptrace_model::{HopRecord, SessionOutcome, SessionStatus};
use serde::Serialize;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;

#[derive(Debug, Serialize)]
pub struct TraceReport<'a> {
    pub started_at_utc: String,
    pub finished_at_utc: String,
    pub program: String,
    pub args: Vec<String>,
    #[serde(flatten)]
    pub outcome: &'a SessionOutcome,
}

pub fn format_hop(hop: &HopRecord) -> String {
    if !hop.has_reply() {
        return format!("{:>3}  *", hop.hop_number);
    }
    let delay = if hop.is_timed_out() {
        "*".to_string()
    } else {
        format!("{:.2} ms", hop.delay_ms)
    };
    let mut line = format!("{:>3}  {:<39} {:>10}", hop.hop_number, hop.address, delay);
    if let Some(owner) = &hop.network_owner {
        line.push_str("  ");
        line.push_str(owner);
    }
    if !hop.geo.is_unknown() {
        line.push_str("  ");
        line.push_str(&hop.geo.label());
    }
    line
}

pub fn describe_status(status: &SessionStatus) -> String {
    match status {
        SessionStatus::Completed => "completed".to_string(),
        SessionStatus::TimedOut => "timed out".to_string(),
        SessionStatus::Cancelled => "cancelled".to_string(),
        SessionStatus::Failed { reason } => format!("failed: {reason}"),
    }
}

/// Writes `value` as pretty JSON. The file is staged next to `path` and
/// renamed over it, so readers never see a half-written report.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;

    let mut staged = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to stage report in {}", dir.display()))?;
    {
        let mut writer = BufWriter::new(staged.as_file_mut());
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.flush()?;
    }
    staged.as_file().sync_all()?;
    staged
        .persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hoptrace_model::Geo;

    #[test]
    fn timed_out_hop_prints_star() {
        assert_eq!(format_hop(&HopRecord::timed_out(2)), "  2  *");
    }

    #[test]
    fn reply_line_carries_owner_and_geo() {
        let mut hop = HopRecord::new(4, "202.97.12.1");
        hop.delay_ms = 9.0;
        hop.network_owner = Some("AS4134".to_string());
        let mut geo = Geo::default();
        geo.fill_unknown(&["China", "Jiangsu", "Nanjing"]);
        hop.geo = geo;
        let line = format_hop(&hop);
        assert!(line.starts_with("  4  202.97.12.1"));
        assert!(line.contains("9.00 ms"));
        assert!(line.ends_with("AS4134  China Jiangsu Nanjing"));
    }

    #[test]
    fn report_is_written_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("report.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"stale").unwrap();
        let outcome = SessionOutcome {
            target: "example.com".to_string(),
            backend: "nexttrace".to_string(),
            hops: vec![HopRecord::new(1, "192.168.1.1")],
            artifact: None,
            status: SessionStatus::Completed,
            exit_code: Some(0),
        };
        let report = TraceReport {
            started_at_utc: "2024-05-01T10:00:00Z".to_string(),
            finished_at_utc: "2024-05-01T10:00:05Z".to_string(),
            program: "nexttrace".to_string(),
            args: vec!["example.com".to_string()],
            outcome: &outcome,
        };
        write_json(&path, &report).unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["target"], "example.com");
        assert_eq!(value["status"]["kind"], "completed");
        assert_eq!(value["hops"][0]["address"], "192.168.1.1");
        let names: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["report.json"]);
    }

    #[test]
    fn missing_directories_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("hops.json");
        write_json(&path, &vec![HopRecord::timed_out(1)]).unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(value[0]["hop_number"], 1);
    }
}
