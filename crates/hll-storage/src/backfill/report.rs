//! Backfill summary report.

use std::fmt::Write as _;

use hll_core::SessionId;
use serde::Serialize;

/// Row counts for one table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableCount {
    /// Table name in the legacy layout (`sessions`, `session_log_<id>`).
    pub table: String,
    /// Rows in the source.
    pub source_rows: u64,
    /// Rows in the destination after the run.
    pub destination_rows: u64,
    /// Rows copied by this run (or that would be, in a dry run).
    pub copied_rows: u64,
}

impl TableCount {
    /// Empty count for `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            source_rows: 0,
            destination_rows: 0,
            copied_rows: 0,
        }
    }

    /// Whether source and destination agree.
    #[must_use]
    pub fn matches(&self) -> bool {
        self.source_rows == self.destination_rows
    }
}

/// A session whose content differs after copying.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecksumMismatch {
    /// Affected session.
    pub session_id: SessionId,
    /// Source checksum.
    pub source: String,
    /// Destination checksum.
    pub destination: String,
}

/// Summary of one backfill run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillReport {
    /// No writes were issued.
    pub dry_run: bool,
    /// Session id the run resumed after, from a checkpoint.
    pub resumed_after: Option<SessionId>,
    /// The `sessions` table.
    pub sessions: TableCount,
    /// One entry per session log table, ascending session id.
    pub tables: Vec<TableCount>,
    /// Sessions whose checksums differ (only with checksums enabled).
    pub checksum_mismatches: Vec<ChecksumMismatch>,
    /// Wall time of the run.
    pub elapsed_ms: u64,
}

impl BackfillReport {
    /// Empty report.
    #[must_use]
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            resumed_after: None,
            sessions: TableCount::new("sessions"),
            tables: Vec::new(),
            checksum_mismatches: Vec::new(),
            elapsed_ms: 0,
        }
    }

    /// Events copied across every log table.
    #[must_use]
    pub fn events_copied(&self) -> u64 {
        self.tables.iter().map(|t| t.copied_rows).sum()
    }

    /// Tables whose counts disagree.
    pub fn count_mismatches(&self) -> impl Iterator<Item = &TableCount> {
        std::iter::once(&self.sessions)
            .chain(&self.tables)
            .filter(|t| !t.matches())
    }

    /// Whether every count and checksum agrees.
    #[must_use]
    pub fn is_parity(&self) -> bool {
        self.count_mismatches().next().is_none() && self.checksum_mismatches.is_empty()
    }

    /// Human-readable summary for the terminal.
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let mode = if self.dry_run { " (dry run)" } else { "" };
        let _ = writeln!(out, "Backfill summary{mode}");
        if let Some(id) = self.resumed_after {
            let _ = writeln!(out, "  resumed after session {id}");
        }
        let _ = writeln!(
            out,
            "  {:<24} {:>12} {:>12} {:>12}",
            "table", "source", "destination", "copied"
        );
        for t in std::iter::once(&self.sessions).chain(&self.tables) {
            let flag = if t.matches() { "" } else { "  MISMATCH" };
            let _ = writeln!(
                out,
                "  {:<24} {:>12} {:>12} {:>12}{flag}",
                t.table, t.source_rows, t.destination_rows, t.copied_rows
            );
        }
        let _ = writeln!(
            out,
            "  {} sessions, {} events copied in {} ms",
            self.sessions.copied_rows,
            self.events_copied(),
            self.elapsed_ms
        );
        for m in &self.checksum_mismatches {
            let _ = writeln!(
                out,
                "  checksum mismatch for session {}: {} != {}",
                m.session_id, m.source, m.destination
            );
        }
        let verdict = if self.is_parity() { "parity" } else { "NOT at parity" };
        let _ = writeln!(out, "  result: {verdict}");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str, source: u64, destination: u64) -> TableCount {
        TableCount {
            table: name.into(),
            source_rows: source,
            destination_rows: destination,
            copied_rows: destination,
        }
    }

    #[test]
    fn parity_requires_matching_counts_and_checksums() {
        let mut report = BackfillReport::new(false);
        report.sessions = table("sessions", 2, 2);
        report.tables = vec![table("session_log_1", 3, 3), table("session_log_2", 5, 5)];
        assert!(report.is_parity());
        assert_eq!(report.events_copied(), 8);

        report.tables[1].destination_rows = 4;
        assert!(!report.is_parity());
        assert_eq!(report.count_mismatches().count(), 1);

        report.tables[1].destination_rows = 5;
        report.checksum_mismatches.push(ChecksumMismatch {
            session_id: SessionId::new(2),
            source: "aa".into(),
            destination: "bb".into(),
        });
        assert!(!report.is_parity());
    }

    #[test]
    fn text_flags_mismatched_tables() {
        let mut report = BackfillReport::new(true);
        report.tables = vec![table("session_log_7", 10, 0)];
        let text = report.render_text();
        assert!(text.contains("(dry run)"));
        assert!(text.contains("session_log_7"));
        assert!(text.contains("MISMATCH"));
        assert!(text.contains("NOT at parity"));
    }

    #[test]
    fn json_is_camel_case() {
        let json = serde_json::to_value(BackfillReport::new(false)).unwrap();
        assert_eq!(json["dryRun"], false);
        assert_eq!(json["sessions"]["sourceRows"], 0);
        assert!(json["checksumMismatches"].as_array().unwrap().is_empty());
    }
}
