use std::path::Path;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

use crate::entity::{Entity, Function, TestStatus};

static DATE_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{8})").expect("date token regex"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DateError {
    #[error("no YYYYMMDD date token in `{name}`")]
    Missing { name: String },
    #[error("date token `{token}` in `{name}` is not a valid date")]
    Unparsable { name: String, token: String },
}

/// Reads the dump's as-of date from the first 8-digit run in the file name.
pub fn parse_dump_date(source_name: &str) -> Result<NaiveDate, DateError> {
    let file_name = Path::new(source_name)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| source_name.to_string());
    let token = DATE_TOKEN
        .captures(&file_name)
        .and_then(|captures| captures.get(1))
        .ok_or_else(|| DateError::Missing {
            name: file_name.clone(),
        })?;
    NaiveDate::parse_from_str(token.as_str(), "%Y%m%d").map_err(|_| DateError::Unparsable {
        name: file_name.clone(),
        token: token.as_str().to_string(),
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionTally {
    pub pass: usize,
    pub fail: usize,
    pub error: usize,
    pub unknown: usize,
    pub total: usize,
}

impl FunctionTally {
    /// Counts every recorded cell across all of the function's implementations.
    pub fn from_function(function: &Function) -> Self {
        let mut tally = Self::default();
        for status in function
            .implementations
            .iter()
            .flat_map(|implementation| implementation.test_results.values())
        {
            tally.record(*status);
        }
        tally
    }

    pub fn record(&mut self, status: TestStatus) {
        self.total += 1;
        match status {
            TestStatus::Pass => self.pass += 1,
            TestStatus::Fail => self.fail += 1,
            TestStatus::Error => self.error += 1,
            TestStatus::Unknown => self.unknown += 1,
        }
    }

    /// `None` when there are no tests at all.
    pub fn failure_rate(&self) -> Option<f64> {
        (self.total > 0).then(|| self.fail as f64 / self.total as f64)
    }

    pub fn all_passed(&self) -> bool {
        self.pass == self.total
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionRow {
    pub id: String,
    pub alias_count: usize,
    pub implementation_count: usize,
    /// Filled in only when the connectivity check ran.
    pub connected_implementations: Option<usize>,
    pub tally: FunctionTally,
    pub language_count: usize,
    pub healthy: bool,
}

impl FunctionRow {
    pub fn from_function(function: &Function) -> Self {
        let tally = FunctionTally::from_function(function);
        let implementation_count = function.implementation_count();
        Self {
            id: function.id().unwrap_or_default().to_string(),
            alias_count: function.alias_count(),
            implementation_count,
            connected_implementations: None,
            tally,
            language_count: function.language_count(),
            healthy: tally.all_passed() && implementation_count > 0,
        }
    }

    /// Numeric part of a `Z123` id, used for range partitioning.
    pub fn id_number(&self) -> Option<u64> {
        self.id.strip_prefix('Z')?.parse().ok()
    }

    pub fn is_deletion_candidate(&self) -> bool {
        self.implementation_count == 0 && self.tally.total == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureBuckets {
    pub zero: usize,
    pub one: usize,
    pub two: usize,
    pub two_or_more: usize,
    pub half_or_more: usize,
    pub all: usize,
}

impl FailureBuckets {
    pub fn from_tallies<'a>(tallies: impl IntoIterator<Item = &'a FunctionTally>) -> Self {
        let mut buckets = Self::default();
        for tally in tallies {
            match tally.fail {
                0 => buckets.zero += 1,
                1 => buckets.one += 1,
                2 => buckets.two += 1,
                _ => {}
            }
            if tally.fail >= 2 {
                buckets.two_or_more += 1;
            }
            if let Some(rate) = tally.failure_rate() {
                if rate >= 0.5 {
                    buckets.half_or_more += 1;
                }
                if tally.fail == tally.total {
                    buckets.all += 1;
                }
            }
        }
        buckets
    }

    /// Label and count pairs in report order.
    pub fn labelled(&self) -> [(&'static str, usize); 6] {
        [
            ("0 failed tests", self.zero),
            ("1 failed test", self.one),
            ("2 failed tests", self.two),
            ("2+ failed tests", self.two_or_more),
            (">=50% failed tests", self.half_or_more),
            ("100% failed tests", self.all),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryStats {
    pub function_count: usize,
    pub mean_implementations: f64,
    pub mean_tests: f64,
    pub buckets: FailureBuckets,
    pub totals: FunctionTally,
    pub deletion_candidates: Vec<String>,
}

impl SummaryStats {
    pub fn from_rows(rows: &[FunctionRow]) -> Self {
        let function_count = rows.len();
        let mut totals = FunctionTally::default();
        let mut implementations = 0usize;
        for row in rows {
            implementations += row.implementation_count;
            totals.pass += row.tally.pass;
            totals.fail += row.tally.fail;
            totals.error += row.tally.error;
            totals.unknown += row.tally.unknown;
            totals.total += row.tally.total;
        }

        Self {
            function_count,
            mean_implementations: mean(implementations, function_count),
            mean_tests: mean(totals.total, function_count),
            buckets: FailureBuckets::from_tallies(rows.iter().map(|row| &row.tally)),
            totals,
            deletion_candidates: rows
                .iter()
                .filter(|row| row.is_deletion_candidate())
                .map(|row| row.id.clone())
                .collect(),
        }
    }
}

fn mean(sum: usize, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum as f64 / count as f64
    }
}

/// Rounded `part` as a percentage of `whole`; zero when `whole` is zero.
pub fn percent(part: usize, whole: usize) -> u64 {
    if whole == 0 {
        0
    } else {
        ((part as f64 * 100.0) / whole as f64).round() as u64
    }
}

#[derive(Debug, Clone)]
pub struct SummaryReport {
    pub as_of: NaiveDate,
    pub source_name: String,
    pub rows: Vec<FunctionRow>,
    pub stats: SummaryStats,
}

impl SummaryReport {
    pub fn new(as_of: NaiveDate, source_name: impl Into<String>, rows: Vec<FunctionRow>) -> Self {
        let stats = SummaryStats::from_rows(&rows);
        Self {
            as_of,
            source_name: source_name.into(),
            rows,
            stats,
        }
    }

    pub fn from_functions(
        as_of: NaiveDate,
        source_name: impl Into<String>,
        functions: &[Function],
    ) -> Self {
        Self::new(
            as_of,
            source_name,
            functions.iter().map(FunctionRow::from_function).collect(),
        )
    }

    pub fn as_of_label(&self) -> String {
        self.as_of.format("%Y-%m-%d").to_string()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::entity::Implementation;

    fn tally(fail: usize, total: usize) -> FunctionTally {
        FunctionTally {
            pass: total - fail,
            fail,
            error: 0,
            unknown: 0,
            total,
        }
    }

    fn row(id: &str, implementations: usize, tally: FunctionTally) -> FunctionRow {
        FunctionRow {
            id: id.to_string(),
            alias_count: 1,
            implementation_count: implementations,
            connected_implementations: None,
            tally,
            language_count: 0,
            healthy: tally.all_passed() && implementations > 0,
        }
    }

    #[test]
    fn failure_buckets_follow_counts_and_rates() {
        let tallies = [(0, 5), (1, 5), (2, 5), (3, 5), (0, 0), (5, 5)]
            .map(|(fail, total)| tally(fail, total));
        let buckets = FailureBuckets::from_tallies(&tallies);
        assert_eq!(buckets.zero, 2);
        assert_eq!(buckets.one, 1);
        assert_eq!(buckets.two, 1);
        assert_eq!(buckets.two_or_more, 3);
        assert_eq!(buckets.half_or_more, 2);
        assert_eq!(buckets.all, 1);
    }

    #[test]
    fn zero_test_function_is_in_no_rate_bucket() {
        let buckets = FailureBuckets::from_tallies(&[tally(0, 0)]);
        assert_eq!(buckets.zero, 1);
        assert_eq!(buckets.half_or_more, 0);
        assert_eq!(buckets.all, 0);
    }

    #[test]
    fn deletion_candidates_need_no_implementations_and_no_tests() {
        let rows = vec![
            row("Z801", 0, tally(0, 0)),
            row("Z802", 0, tally(1, 3)),
            row("Z803", 2, tally(0, 0)),
        ];
        let stats = SummaryStats::from_rows(&rows);
        assert_eq!(stats.deletion_candidates, vec!["Z801".to_string()]);
        assert_eq!(stats.function_count, 3);
        assert!((stats.mean_implementations - 2.0 / 3.0).abs() < 1e-9);
        assert!((stats.mean_tests - 1.0).abs() < 1e-9);
        assert_eq!(stats.totals.fail, 1);
    }

    #[test]
    fn empty_report_has_zero_means() {
        let stats = SummaryStats::from_rows(&[]);
        assert_eq!(stats.mean_implementations, 0.0);
        assert_eq!(stats.mean_tests, 0.0);
        assert_eq!(percent(3, 0), 0);
        assert_eq!(percent(1, 3), 33);
    }

    #[test]
    fn rows_tally_recorded_results_and_health() {
        let mut passing = Implementation::from_value(json!({"Z2K1": {"Z6K1": "Z11"}}));
        passing.test_results.insert("Z21".to_string(), TestStatus::Pass);
        passing.test_results.insert("Z22".to_string(), TestStatus::Pass);
        let mut failing = passing.clone();
        failing.test_results.insert("Z22".to_string(), TestStatus::Error);

        let mut function = Function::from_value(json!({
            "Z1K1": "Z2",
            "Z2K1": {"Z1K1": "Z6", "Z6K1": "Z10"},
            "Z2K2": {"Z1K1": "Z8"}
        }));
        function.implementations = vec![passing.clone()];
        let healthy = FunctionRow::from_function(&function);
        assert!(healthy.healthy);
        assert_eq!(healthy.tally.total, 2);
        assert_eq!(healthy.id_number(), Some(10));

        function.implementations = vec![passing, failing];
        let degraded = FunctionRow::from_function(&function);
        assert!(!degraded.healthy);
        assert_eq!(degraded.tally.error, 1);
        assert_eq!(degraded.tally.fail, 0);

        function.implementations.clear();
        let bare = FunctionRow::from_function(&function);
        assert!(!bare.healthy);
        assert!(bare.is_deletion_candidate());
    }

    #[test]
    fn dump_date_comes_from_file_name() {
        let date = parse_dump_date("output/wikifunctionswiki-20250301-pages-meta-current-ZID-and-json-only.jsonl")
            .expect("date");
        assert_eq!(date, NaiveDate::from_ymd_opt(2025, 3, 1).expect("valid date"));

        assert_eq!(
            parse_dump_date("data/20250101/dump.jsonl"),
            Err(DateError::Missing {
                name: "dump.jsonl".to_string()
            })
        );
        assert!(matches!(
            parse_dump_date("dump-20251341.jsonl"),
            Err(DateError::Unparsable { .. })
        ));
    }
}
