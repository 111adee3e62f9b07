use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::aggregate::{FunctionRow, SummaryReport, percent};
use crate::pipeline::StatusMap;

const HEALTHY: &str = "✅";
const UNHEALTHY: &str = "❌";

/// Id ranges that get their own table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub min: u64,
    pub max: Option<u64>,
}

impl IdRange {
    pub fn contains(&self, number: u64) -> bool {
        number >= self.min && self.max.is_none_or(|max| number <= max)
    }

    pub fn file_suffix(&self) -> String {
        match self.max {
            Some(max) => format!("{}-{max}", self.min),
            None => format!("{}+", self.min),
        }
    }
}

pub const TABLE_RANGES: [IdRange; 3] = [
    IdRange {
        min: 1,
        max: Some(9_999),
    },
    IdRange {
        min: 10_000,
        max: Some(19_999),
    },
    IdRange {
        min: 20_000,
        max: None,
    },
];

fn prefixed(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(format!("-{suffix}.txt"));
    PathBuf::from(name)
}

pub fn table_path(prefix: &Path, range: &IdRange) -> PathBuf {
    prefixed(prefix, &range.file_suffix())
}

pub fn summary_path(prefix: &Path) -> PathBuf {
    prefixed(prefix, "summary")
}

pub fn render_table(report: &SummaryReport, range: &IdRange) -> String {
    let mut out = format!(
        "'''Health Status''': {HEALTHY} = all tests pass AND at least one implementation exists, {UNHEALTHY} = otherwise\n\n\
         Last update: {}\n\
         {{| class=\"wikitable sortable\"\n\
         ! rowspan='2' | Function\n\
         ! rowspan='2' | Aliases\n\
         ! colspan='3' | Connected\n\
         ! rowspan='2' | Translations\n\
         ! rowspan='2' | Health Status\n\
         |-\n\
         ! Implementations\n\
         ! Pass / Fail\n\
         ! Total Tests\n",
        report.as_of_label()
    );

    for row in report
        .rows
        .iter()
        .filter(|row| row.id_number().is_some_and(|number| range.contains(number)))
    {
        out.push_str(&render_row(row));
    }

    out.push_str("|}\nNote: Disconnected tests/implementations are not presently in the dump\n\n");
    out
}

fn render_row(row: &FunctionRow) -> String {
    let implementations = match row.connected_implementations {
        Some(connected) => format!("{} ({connected} connected)", row.implementation_count),
        None => row.implementation_count.to_string(),
    };
    let health = if row.healthy { HEALTHY } else { UNHEALTHY };
    let mut pass_fail = format!("{} / {}", row.tally.pass, row.tally.fail);
    if row.tally.error > 0 {
        pass_fail.push_str(&format!(" ({} error)", row.tally.error));
    }
    format!(
        "|-\n| [[{}]] || {} || {} || {} || {} || {} || {}\n",
        row.id,
        row.alias_count,
        implementations,
        pass_fail,
        row.tally.total,
        row.language_count,
        health
    )
}

pub fn render_summary(report: &SummaryReport) -> String {
    let stats = &report.stats;
    let functions = stats.function_count;
    let candidates = stats.deletion_candidates.len();

    let mut out = format!(
        "== Z8 Summary ==\n\
         (last update: {})\n\n  \
         Number of functions processed: {functions}\n  \
         Mean number of implementations per function: {:.2}\n  \
         Mean number of tests per function: {:.2}\n  \
         Deletion candidates: {candidates} ({}%)\n",
        report.as_of_label(),
        stats.mean_implementations,
        stats.mean_tests,
        percent(candidates, functions)
    );

    out.push_str("\n=== Functions by failed tests count ===\n");
    for (label, count) in stats.buckets.labelled() {
        out.push_str(&format!("  {label}: {count} ({}%)\n", percent(count, functions)));
    }

    out.push_str("\n=== Total tests by status ===\n");
    let totals = &stats.totals;
    for (label, count) in [
        ("Pass", totals.pass),
        ("Fail", totals.fail),
        ("Error", totals.error),
    ] {
        out.push_str(&format!("  {label}: {count} ({}%)\n", percent(count, totals.total)));
    }

    out.push_str("\n== Maintenance candidates ==\n");
    out.push_str("Deletion candidates (no implementations, no tests):\n");
    if stats.deletion_candidates.is_empty() {
        out.push_str("  (none)\n");
    }
    for id in &stats.deletion_candidates {
        out.push_str(&format!("* [[{id}]]\n"));
    }
    out
}

/// Writes the three range tables and the summary next to `prefix`.
pub fn write_report(report: &SummaryReport, prefix: &Path) -> Result<Vec<PathBuf>> {
    if let Some(parent) = prefix.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut written = Vec::with_capacity(TABLE_RANGES.len() + 1);
    for range in &TABLE_RANGES {
        let path = table_path(prefix, range);
        write_file(&path, &render_table(report, range))?;
        written.push(path);
    }
    let path = summary_path(prefix);
    write_file(&path, &render_summary(report))?;
    written.push(path);

    tracing::info!(files = written.len(), prefix = %prefix.display(), "wikitext written");
    Ok(written)
}

/// Debug dump of every recorded cell.
pub fn write_status_map(path: &Path, statuses: &StatusMap) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let rendered =
        serde_json::to_string_pretty(statuses).context("failed to serialize status map")?;
    write_file(path, &rendered)?;
    tracing::info!(path = %path.display(), implementations = statuses.len(), "status map written");
    Ok(())
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
}
