use std::collections::BTreeMap;

use crate::aggregate::{DateError, FunctionRow, SummaryReport, parse_dump_date};
use crate::client::{ApiTransport, StatusQuery, WikifunctionsClient};
use crate::entity::{Entity, Function, Implementation, TestStatus, Tester};
use crate::entity_map::{
    EntityMap, JsonlSource, MapError, MapOptions, build_map, next_line, parse_line, read_error,
};
use crate::resolver::{resolve_implementations, resolve_testers};

/// implementation id -> tester id -> status
pub type StatusMap = BTreeMap<String, BTreeMap<String, TestStatus>>;

#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub map: MapOptions,
    /// Stop collecting functions after this many. Debug throttle.
    pub max_functions: Option<usize>,
    pub check_connectivity: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Date(#[from] DateError),
    #[error(transparent)]
    Map(#[from] MapError),
}

impl PipelineError {
    /// Short name of the fatal condition, for the first line of a diagnostic.
    pub fn condition(&self) -> &'static str {
        match self {
            Self::Date(_) => "DateError",
            Self::Map(MapError::InsufficientData { .. }) => "InsufficientDataError",
            Self::Map(MapError::Io { .. }) => "IoError",
        }
    }
}

#[derive(Debug)]
pub struct PipelineOutcome {
    pub report: SummaryReport,
    pub status_map: StatusMap,
    pub requests: usize,
}

/// One dump-processing run. Owns the client so the transport lives exactly as
/// long as the run.
pub struct Pipeline<T> {
    client: WikifunctionsClient<T>,
    options: PipelineOptions,
}

impl<T: ApiTransport> Pipeline<T> {
    pub fn new(client: WikifunctionsClient<T>, options: PipelineOptions) -> Self {
        Self { client, options }
    }

    pub fn client(&self) -> &WikifunctionsClient<T> {
        &self.client
    }

    pub fn run(&self, source: &dyn JsonlSource) -> Result<PipelineOutcome, PipelineError> {
        let as_of = parse_dump_date(source.name())?;
        tracing::info!(source = source.name(), %as_of, "starting statistics run");

        let testers = build_map::<Tester>(source, &self.options.map)?;
        let implementations = build_map::<Implementation>(source, &self.options.map)?;

        let mut functions = self.collect_functions(source, &testers, &implementations)?;
        drop(testers);
        drop(implementations);

        self.fetch_statuses(&mut functions);

        let mut rows = functions
            .iter()
            .map(FunctionRow::from_function)
            .collect::<Vec<_>>();
        if self.options.check_connectivity {
            self.attach_connectivity(&mut rows);
        }

        let report = SummaryReport::new(as_of, source.name(), rows);
        tracing::info!(
            functions = report.stats.function_count,
            tests = report.stats.totals.total,
            errors = report.stats.totals.error,
            deletion_candidates = report.stats.deletion_candidates.len(),
            requests = self.client.request_count(),
            "statistics run complete"
        );
        Ok(PipelineOutcome {
            status_map: status_map(&functions),
            report,
            requests: self.client.request_count(),
        })
    }

    /// Streams function records in source order, resolving each one.
    pub fn collect_functions(
        &self,
        source: &dyn JsonlSource,
        testers: &EntityMap<Tester>,
        implementations: &EntityMap<Implementation>,
    ) -> Result<Vec<Function>, MapError> {
        tracing::info!(source = source.name(), "collecting functions");
        let mut reader = source.open().map_err(|error| read_error(source, error))?;
        let interval = self.options.map.progress_interval.max(1);
        let mut functions = Vec::new();
        let mut line = Vec::new();
        let mut processed = 0usize;

        while next_line(&mut reader, &mut line).map_err(|error| read_error(source, error))? {
            processed += 1;
            if processed % interval == 0 {
                tracing::info!(lines = processed, functions = functions.len(), "function scan progress");
            }

            let Some(object) = parse_line(&line) else {
                continue;
            };
            let mut function = Function::from_object(object);
            if !function.is_correct_kind() || function.id().is_err() {
                continue;
            }
            resolve_testers(&mut function, testers);
            resolve_implementations(&mut function, implementations);
            tracing::debug!(
                function = function.id().unwrap_or_default(),
                testers = function.tester_count(),
                implementations = function.implementation_count(),
                "resolved function"
            );
            functions.push(function);

            if self
                .options
                .max_functions
                .is_some_and(|limit| functions.len() >= limit)
            {
                tracing::info!(limit = functions.len(), "reached function limit, stopping early");
                break;
            }
        }

        tracing::info!(functions = functions.len(), "functions collected");
        Ok(functions)
    }

    /// Queries every (function, implementation, tester) cell and records the
    /// result. Each cell starts as `Unknown` and is written exactly once.
    pub fn fetch_statuses(&self, functions: &mut [Function]) {
        let mut cells = Vec::new();
        let mut queries = Vec::new();
        for (function_index, function) in functions.iter_mut().enumerate() {
            let Ok(function_id) = function.id().map(ToString::to_string) else {
                continue;
            };
            let tester_ids = function
                .testers
                .iter()
                .filter_map(|tester| tester.id().ok().map(ToString::to_string))
                .collect::<Vec<_>>();
            for (implementation_index, implementation) in
                function.implementations.iter_mut().enumerate()
            {
                let Ok(implementation_id) = implementation.id().map(ToString::to_string) else {
                    continue;
                };
                for tester_id in &tester_ids {
                    if implementation.test_results.contains_key(tester_id) {
                        continue;
                    }
                    implementation
                        .test_results
                        .insert(tester_id.clone(), TestStatus::Unknown);
                    cells.push((function_index, implementation_index, tester_id.clone()));
                    queries.push(StatusQuery {
                        function_id: function_id.clone(),
                        implementation_id: implementation_id.clone(),
                        tester_id: tester_id.clone(),
                    });
                }
            }
        }

        tracing::info!(
            queries = queries.len(),
            concurrency = self.client.concurrency(),
            "fetching test statuses"
        );
        let statuses = self.client.bulk_fetch_test_statuses(&queries);

        for ((function_index, implementation_index, tester_id), status) in
            cells.into_iter().zip(statuses)
        {
            functions[function_index].implementations[implementation_index]
                .test_results
                .insert(tester_id, status);
        }
    }

    fn attach_connectivity(&self, rows: &mut [FunctionRow]) {
        let ids = rows.iter().map(|row| row.id.clone()).collect::<Vec<_>>();
        tracing::info!(functions = ids.len(), "checking connected implementations");
        let connected = self.client.bulk_fetch_connected_implementations(&ids);
        for row in rows {
            row.connected_implementations = connected.get(&row.id).map(Vec::len);
        }
    }
}

pub fn status_map(functions: &[Function]) -> StatusMap {
    let mut map = StatusMap::new();
    for implementation in functions.iter().flat_map(|function| &function.implementations) {
        let Ok(id) = implementation.id() else {
            continue;
        };
        map.entry(id.to_string())
            .or_default()
            .extend(implementation.test_results.iter().map(|(tester, status)| (tester.clone(), *status)));
    }
    map
}
