//! Offline replay of a recorded session.
//!
//! Reads `events.jsonl`, re-emits every outbound message exactly as the
//! client saw it live (direction stripped, one JSON line each), and writes
//! `replay_report.md` with the full chronological `direction:type`
//! sequence. The report is the ground truth for the determinism check: a
//! correct implementation replays the exact outbound type sequence that was
//! recorded.

use maestro_proto::{Direction, Event, LineCodec, Result};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use tracing::warn;

/// What a replay pass observed in the log.
#[derive(Debug, Clone, Default)]
pub struct ReplaySummary {
    /// Outbound messages re-emitted.
    pub emitted: usize,
    /// Full chronological `direction:type` sequence.
    pub sequence: Vec<String>,
    /// Outbound `type` values, in order.
    pub outbound_kinds: Vec<String>,
}

/// Replays the session recorded in `session_dir`, writing outbound lines to
/// `out` and the report to `replay_report.md` inside the session directory.
pub fn replay_session<W: Write>(session_dir: &Path, out: &mut W) -> Result<ReplaySummary> {
    let events = read_events(&session_dir.join("events.jsonl"))?;

    let mut summary = ReplaySummary::default();
    for event in &events {
        summary
            .sequence
            .push(format!("{}:{}", event.direction.as_str(), event.kind));
        if event.direction == Direction::Out {
            out.write_all(LineCodec::encode(&event.to_wire()).as_bytes())?;
            summary.outbound_kinds.push(event.kind.clone());
            summary.emitted += 1;
        }
    }
    out.flush()?;

    fs::write(
        session_dir.join("replay_report.md"),
        render_report(&summary, events.len()),
    )?;
    Ok(summary)
}

/// Parses the event log, skipping malformed lines with a warning.
pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut events = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(&line) {
            Ok(event) => events.push(event),
            Err(e) => warn!(line_number = number + 1, error = %e, "skipping malformed event line"),
        }
    }
    Ok(events)
}

fn render_report(summary: &ReplaySummary, total: usize) -> String {
    let mut report = String::from("# Replay Report\n\n");
    report.push_str(&format!(
        "Events: {total} total, {} outbound re-emitted\n\n## Event sequence\n\n",
        summary.emitted
    ));
    for (i, entry) in summary.sequence.iter().enumerate() {
        report.push_str(&format!("{}. {entry}\n", i + 1));
    }
    report
}
