use std::{
    fs,
    io::{self, Write},
    path::Path,
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use crispcheck_core::{BatchReport, BatchSummary, ResultSummary};
use serde::Serialize;
use uuid::Uuid;

use crate::settings::OutputSettings;

/// The JSON document written at the end of a run.
#[derive(Debug, Serialize)]
pub struct ReportDocument {
    pub generated_at: DateTime<Utc>,
    pub batch_id: Uuid,
    pub cancelled: bool,
    pub summary: BatchSummary,
    pub results: Vec<ReportEntry>,
}

#[derive(Debug, Serialize)]
pub struct ReportEntry {
    #[serde(flatten)]
    pub result: ResultSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<Vec<String>>,
}

impl ReportDocument {
    pub fn from_batch(report: &BatchReport, include_trace: bool) -> Self {
        let results = report
            .outcomes
            .iter()
            .map(|outcome| ReportEntry {
                result: ResultSummary::from(outcome),
                trace: include_trace.then(|| outcome.trace.lines().collect()),
            })
            .collect();

        Self {
            generated_at: Utc::now(),
            batch_id: report.batch_id,
            cancelled: report.cancelled,
            summary: report.summary(),
            results,
        }
    }

    pub fn render(&self, pretty: bool) -> anyhow::Result<String> {
        let rendered = if pretty {
            serde_json::to_string_pretty(self)
        } else {
            serde_json::to_string(self)
        };
        rendered.context("failed to serialize report")
    }
}

/// Writes the report to `output`, or to stdout when no path is given.
pub fn write_report(
    report: &BatchReport,
    output: Option<&Path>,
    settings: &OutputSettings,
) -> anyhow::Result<()> {
    let document = ReportDocument::from_batch(report, settings.include_trace);
    let mut rendered = document.render(settings.pretty)?;
    rendered.push('\n');

    match output {
        Some(path) => {
            ensure_parent(path)?;
            fs::write(path, rendered)
                .with_context(|| format!("failed to write report to {}", path.display()))?;
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout
                .write_all(rendered.as_bytes())
                .and_then(|()| stdout.flush())
                .context("failed to write report to stdout")?;
        }
    }
    Ok(())
}

/// Writes one `url,status,error` row per target, in input order.
pub fn write_csv(report: &BatchReport, path: &Path) -> anyhow::Result<()> {
    ensure_parent(path)?;
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer.write_record(["url", "status", "error"])?;
    for outcome in &report.outcomes {
        let result = ResultSummary::from(outcome);
        writer.write_record([
            result.url.as_str(),
            result.status.label(),
            result.error.as_deref().unwrap_or_default(),
        ])?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to write results to {}", path.display()))?;
    Ok(())
}

fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crispcheck_core::{Classification, DetectionOutcome, Target, Trace};
    use serde_json::Value;

    fn sample() -> BatchReport {
        let detected = DetectionOutcome {
            target: Target::new("https://a.test"),
            classification: Classification::Detected,
            diagnostic: None,
            detail: None,
            trace: Trace::default(),
        };
        BatchReport::new(
            Uuid::now_v7(),
            true,
            vec![
                detected,
                DetectionOutcome::cancelled_before_start(Target::new("https://b.test")),
            ],
        )
    }

    #[test]
    fn document_flattens_results_in_input_order() {
        let report = sample();
        let rendered = ReportDocument::from_batch(&report, false).render(false).unwrap();
        let value: Value = serde_json::from_str(&rendered).unwrap();

        assert_eq!(value["batch_id"], report.batch_id.to_string());
        assert_eq!(value["cancelled"], true);
        assert_eq!(value["summary"]["total"], 2);
        assert_eq!(value["summary"]["cancelled"], 1);

        let results = value["results"].as_array().unwrap();
        assert_eq!(results[0]["url"], "https://a.test");
        assert_eq!(results[0]["status"], "Uses Crisp");
        assert!(results[0].get("error").is_none());
        assert!(results[0].get("trace").is_none());
        assert_eq!(results[1]["error"], "CancelledBeforeStart: cancelled before start");
    }

    #[test]
    fn trace_lines_are_included_on_request() {
        let rendered = ReportDocument::from_batch(&sample(), true).render(true).unwrap();
        let value: Value = serde_json::from_str(&rendered).unwrap();

        let trace = value["results"][1]["trace"].as_array().unwrap();
        assert_eq!(trace.len(), 1);
        assert!(trace[0].as_str().unwrap().contains("not run: cancelled before start"));
        assert!(rendered.contains("\n  "));
    }

    #[test]
    fn report_is_written_to_nested_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/report.json");

        write_report(&sample(), Some(&path), &OutputSettings::default()).unwrap();

        let value: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["results"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn csv_results_use_status_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results/crisp_check_results.csv");

        write_csv(&sample(), &path).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        assert_eq!(reader.headers().unwrap(), vec!["url", "status", "error"]);
        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0], vec!["https://a.test", "Uses Crisp", ""]);
        assert_eq!(
            &rows[1],
            vec!["https://b.test", "Cancelled", "CancelledBeforeStart: cancelled before start"]
        );
    }
}
