//! Run coordination.
//!
//! The orchestrator fans sources out to a bounded worker pool, collects one
//! hand-off per source over a channel, reduces the partial aggregates and runs
//! the two derivations. Per-source failures degrade the run to a partial
//! success; configuration errors stop it before anything is dispatched.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use crate::aggregate::{reduce, GlobalAggregate};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::normalize::{RawRow, RejectKind};
use crate::source::{MemorySource, RowSource};
use crate::spatial::SpatialWeightBuilder;
use crate::temporal::{DeviceTemporalStats, TemporalAnalyzer};
use crate::worker::{map_source, MapOutput, Rejection};
use crate::WeightedPoint;

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every source was processed.
    Success,
    /// Some sources failed; the aggregate covers the rest.
    PartialSuccess,
    /// No source could be processed.
    Failure,
}

/// A source whose rows are missing from the aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkFailure {
    pub source: u32,
    pub label: String,
    pub reason: String,
}

/// Per-run totals, independent of the derived artifacts.
///
/// `rows_seen == record_count + rejected_count + duplicate_count`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    pub rows_seen: usize,
    pub record_count: usize,
    pub rejected_count: usize,
    pub duplicate_count: usize,
    pub sources_planned: usize,
    pub sources_completed: usize,
    pub chunks_mapped: usize,
    pub rejections: Vec<Rejection>,
    pub rejections_by_kind: BTreeMap<RejectKind, usize>,
    pub failed_sources: Vec<ChunkFailure>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

/// Everything a run produces.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: RunStatus,
    pub diagnostics: Diagnostics,
    pub aggregate: GlobalAggregate,
    pub device_stats: Vec<DeviceTemporalStats>,
    pub points: Vec<WeightedPoint>,
}

/// Drives a map-reduce run over a set of row sources.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: EngineConfig,
    analyzer: TemporalAnalyzer,
    builder: SpatialWeightBuilder,
}

impl Orchestrator {
    /// Validate `config` and prepare an orchestrator. Fails fast on any
    /// configuration error, including a missing `max_gap`.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let analyzer = TemporalAnalyzer::new(config.temporal()?)?;
        let builder = SpatialWeightBuilder::new(config.weighting.clone());
        Ok(Self {
            config,
            analyzer,
            builder,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn analyzer(&self) -> &TemporalAnalyzer {
        &self.analyzer
    }

    /// Run over in-memory chunks given as `(label, rows)`.
    pub fn run_rows(&self, chunks: Vec<(String, Vec<RawRow>)>) -> Result<RunReport> {
        let sources = chunks
            .into_iter()
            .map(|(label, rows)| Arc::new(MemorySource::new(label, rows)) as Arc<dyn RowSource>)
            .collect();
        self.run(sources)
    }

    /// Run over `sources`, one map task per source.
    ///
    /// Returns `Err` only when the pool cannot be built or the reduced
    /// aggregate breaks its invariants; source failures are reported in the
    /// diagnostics with a degraded [`RunStatus`].
    pub fn run(&self, sources: Vec<Arc<dyn RowSource>>) -> Result<RunReport> {
        let started = Instant::now();
        let pool = WorkerPool::new(self.config.workers)?;

        info!(
            "[Orchestrator] Mapping {} sources (max {} rows per chunk)",
            sources.len(),
            self.config.max_rows_per_chunk
        );

        let outcomes = pool.map_sources(&sources, &self.config);

        let mut diagnostics = Diagnostics {
            sources_planned: sources.len(),
            ..Default::default()
        };
        let mut outputs: Vec<MapOutput> = Vec::new();

        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(mut mapped) => {
                    diagnostics.sources_completed += 1;
                    outputs.append(&mut mapped);
                }
                Err(error) => {
                    let label = sources[index].label();
                    warn!("[Orchestrator] Source '{}' failed: {}", label, error);
                    diagnostics.failed_sources.push(ChunkFailure {
                        source: index as u32,
                        label,
                        reason: error.to_string(),
                    });
                }
            }
        }

        // Fixed leaf order keeps the reduction tree shape reproducible.
        outputs.sort_by_key(|o| o.chunk_id);
        diagnostics.chunks_mapped = outputs.len();

        let mut partials = Vec::with_capacity(outputs.len());
        for output in outputs {
            for rejection in &output.rejections {
                *diagnostics
                    .rejections_by_kind
                    .entry(rejection.reason.kind())
                    .or_insert(0) += 1;
            }
            diagnostics.rejections.extend(output.rejections);
            partials.push(output.partial);
        }

        let (aggregate, device_stats, points) = pool.install(|| -> Result<_> {
            let reduced = reduce(partials, self.config.reduce_strategy);
            let aggregate = GlobalAggregate::finalize(reduced, self.config.duplicate_policy)?;
            let (device_stats, points) = self.derive(&aggregate);
            Ok((aggregate, device_stats, points))
        })?;

        diagnostics.record_count = aggregate.record_count();
        diagnostics.rejected_count = aggregate.rejected_count();
        diagnostics.duplicate_count = aggregate.duplicate_count();
        diagnostics.rows_seen =
            diagnostics.record_count + diagnostics.rejected_count + diagnostics.duplicate_count;
        diagnostics.elapsed = started.elapsed();

        let status = if diagnostics.failed_sources.is_empty() {
            RunStatus::Success
        } else if diagnostics.sources_completed > 0 {
            RunStatus::PartialSuccess
        } else {
            RunStatus::Failure
        };

        info!(
            "[Orchestrator] {:?}: {} records, {} rejected, {} duplicates, {} devices, {} points in {:?}",
            status,
            diagnostics.record_count,
            diagnostics.rejected_count,
            diagnostics.duplicate_count,
            aggregate.device_count(),
            points.len(),
            diagnostics.elapsed
        );

        Ok(RunReport {
            status,
            diagnostics,
            aggregate,
            device_stats,
            points,
        })
    }

    /// Temporal stats and weighted points. They only read the aggregate, so
    /// they run concurrently unless the weighting needs the stats first.
    fn derive(
        &self,
        aggregate: &GlobalAggregate,
    ) -> (Vec<DeviceTemporalStats>, Vec<WeightedPoint>) {
        if self.builder.config().mode.needs_device_stats() {
            let stats = self.analyzer.analyze(aggregate);
            let points = self.builder.build_with_stats(aggregate, &stats);
            (stats, points)
        } else {
            crate::aggregate::join(
                || self.analyzer.analyze(aggregate),
                || self.builder.build_with_stats(aggregate, &[]),
            )
        }
    }
}

/// Read and map one source, turning errors and panics into a failure.
fn process_source(
    index: u32,
    source: &dyn RowSource,
    config: &EngineConfig,
) -> Result<Vec<MapOutput>> {
    use std::panic::{catch_unwind, AssertUnwindSafe};

    let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<Vec<MapOutput>> {
        let rows = source.read_rows()?;
        debug!("[Map] {} rows from '{}'", rows.len(), source.label());
        Ok(map_source(
            index,
            &rows,
            config.max_rows_per_chunk,
            &config.fields,
        ))
    }));

    match outcome {
        Ok(Ok(outputs)) => Ok(outputs),
        Ok(Err(
            EngineError::SourceUnreadable { reason, .. } | EngineError::WorkerFailure { reason, .. },
        )) => Err(EngineError::WorkerFailure {
            source_label: source.label(),
            reason,
        }),
        Ok(Err(other)) => Err(EngineError::WorkerFailure {
            source_label: source.label(),
            reason: other.to_string(),
        }),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(EngineError::WorkerFailure {
                source_label: source.label(),
                reason: format!("worker panicked: {message}"),
            })
        }
    }
}

// ============================================================================
// Worker Pool
// ============================================================================

/// Map tasks and the reduce phase run on separate pools. A source that
/// outlives `run_timeout` keeps its map thread, so the reduce pool must never
/// queue behind it.
#[cfg(feature = "parallel")]
struct WorkerPool {
    map: rayon::ThreadPool,
    reduce: rayon::ThreadPool,
}

#[cfg(feature = "parallel")]
impl WorkerPool {
    fn new(workers: usize) -> Result<Self> {
        let build = |role: &'static str| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(move |i| format!("fleettrace-{role}-{i}"))
                .build()
                .map_err(|e| EngineError::ThreadPool(e.to_string()))
        };
        Ok(Self {
            map: build("map")?,
            reduce: build("reduce")?,
        })
    }

    fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        self.reduce.install(op)
    }

    /// Spawn one task per source and wait for exactly that many hand-offs,
    /// bounded by `run_timeout`. Sources that never report are failures.
    fn map_sources(
        &self,
        sources: &[Arc<dyn RowSource>],
        config: &EngineConfig,
    ) -> Vec<Result<Vec<MapOutput>>> {
        use std::sync::mpsc::{self, RecvTimeoutError};

        let expected = sources.len();
        let (tx, rx) = mpsc::channel();

        for (index, source) in sources.iter().enumerate() {
            let tx = tx.clone();
            let source = Arc::clone(source);
            let config = config.clone();
            self.map.spawn(move || {
                let outcome = process_source(index as u32, source.as_ref(), &config);
                // The receiver is gone if the run already timed out.
                let _ = tx.send((index, outcome));
            });
        }
        drop(tx);

        let deadline = config.run_timeout.map(|timeout| Instant::now() + timeout);
        let mut results: Vec<Option<Result<Vec<MapOutput>>>> =
            (0..expected).map(|_| None).collect();
        let mut received = 0;
        let mut missing_reason = "worker exited without reporting".to_string();

        while received < expected {
            let message = match deadline {
                Some(deadline) => {
                    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                        Ok(message) => message,
                        Err(RecvTimeoutError::Timeout) => {
                            missing_reason = format!(
                                "no result within {:?}",
                                config.run_timeout.unwrap_or_default()
                            );
                            break;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match rx.recv() {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };

            let (index, outcome) = message;
            if results[index].is_none() {
                received += 1;
            }
            results[index] = Some(outcome);
        }

        results
            .into_iter()
            .enumerate()
            .map(|(index, result)| {
                result.unwrap_or_else(|| {
                    Err(EngineError::WorkerFailure {
                        source_label: sources[index].label(),
                        reason: missing_reason.clone(),
                    })
                })
            })
            .collect()
    }
}

/// Sequential stand-in used without the `parallel` feature. `run_timeout` is
/// not enforced here since everything runs on the calling thread.
#[cfg(not(feature = "parallel"))]
struct WorkerPool;

#[cfg(not(feature = "parallel"))]
impl WorkerPool {
    fn new(_workers: usize) -> Result<Self> {
        Ok(Self)
    }

    fn install<R>(&self, op: impl FnOnce() -> R) -> R {
        op()
    }

    fn map_sources(
        &self,
        sources: &[Arc<dyn RowSource>],
        config: &EngineConfig,
    ) -> Vec<Result<Vec<MapOutput>>> {
        sources
            .iter()
            .enumerate()
            .map(|(index, source)| process_source(index as u32, source.as_ref(), config))
            .collect()
    }
}
