//! NDJSON sample source.
//!
//! One JSON `Sample` per line, from a file or stdin. Blank lines are ignored,
//! malformed lines are logged and skipped.

use kpistream_core::error::CoreError;
use kpistream_core::models::sample::Sample;
use kpistream_pipeline::collector::SampleCollector;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

/// Counters for one pass over the input
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SourceStats {
    pub lines: u64,
    pub submitted: u64,
    pub malformed: u64,
    /// Intake closed before the input ended
    pub cut_short: bool,
}

/// Feed every parsable line into the collector until EOF or intake closes.
pub async fn pump<R>(reader: R, collector: SampleCollector) -> Result<SourceStats, CoreError>
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = SourceStats::default();
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        stats.lines += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let sample: Sample = match serde_json::from_str(line) {
            Ok(sample) => sample,
            Err(e) => {
                stats.malformed += 1;
                warn!("line {}: skipping malformed sample: {e}", stats.lines);
                continue;
            }
        };

        if let Err(e) = collector.submit(sample).await {
            warn!("line {}: {e}, stopping input", stats.lines);
            stats.cut_short = true;
            break;
        }
        stats.submitted += 1;
    }

    debug!(
        "input done: {} lines, {} submitted, {} malformed",
        stats.lines, stats.submitted, stats.malformed
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn skips_blank_and_malformed_lines() {
        let input = concat!(
            r#"{"label":"home","timestamp":"2024-05-01T10:00:00Z","response_time":0.2}"#,
            "\n\n",
            "not json\n",
            r#"{"label":"cart","timestamp":"2024-05-01T10:00:01Z","response_time":0.4,"success":false}"#,
            "\n",
        );
        let (collector, mut rx) = SampleCollector::channel(8);

        let stats = pump(input.as_bytes(), collector).await.unwrap();

        assert_eq!(stats.lines, 4);
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.malformed, 1);
        assert!(!stats.cut_short);
        assert_eq!(rx.recv().await.unwrap().label, "home");
        assert!(!rx.recv().await.unwrap().success);
    }

    #[tokio::test]
    async fn stops_when_intake_closes() {
        let input = r#"{"label":"home","timestamp":"2024-05-01T10:00:00Z","response_time":0.2}"#;
        let (collector, rx) = SampleCollector::channel(1);
        drop(rx);

        let stats = pump(input.as_bytes(), collector).await.unwrap();

        assert_eq!(stats.submitted, 0);
        assert!(stats.cut_short);
    }
}
