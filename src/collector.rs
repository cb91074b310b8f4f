//! Request sample collection and aggregation.
//!
//! Every completed request produces one [`RequestSample`] held in a
//! fixed-capacity ring buffer (FIFO eviction). The buffer is derived,
//! non-authoritative state: it is rebuilt continuously from live traffic and
//! never persisted across restarts.
//!
//! # Thread Safety
//!
//! The buffer is shared mutable state across concurrent requests. Push and
//! evict happen as one atomic unit under a mutex, so the buffer can never
//! exceed its capacity even under parallel recording. The collector is an
//! explicitly constructed, injectable component (shared through `AppState`),
//! never a module-level singleton, so tests instantiate isolated instances.
//!
//! # Best-Effort Guarantee
//!
//! Nothing in this module may abort a wrapped request. Lock poisoning is
//! recovered, a missing process handle degrades resource figures to zero,
//! and all failures are logged and swallowed.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, get_current_pid};
use tracing::{debug, info, warn};

/// One record per completed (or cancelled) request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSample {
    /// Correlation id, echoed in the `x-request-id` response header.
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: f64,
    /// Accumulated process CPU time consumed during the request, in
    /// milliseconds (user + system combined).
    pub cpu_time_ms: u64,
    /// Resident set size at completion, in bytes.
    pub rss_bytes: u64,
    /// Virtual memory size at completion, in bytes.
    pub virtual_mem_bytes: u64,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time view of the process's resource counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceSnapshot {
    /// Cumulative process CPU time in milliseconds.
    pub cpu_time_ms: u64,
    /// Resident set size in bytes.
    pub rss_bytes: u64,
    /// Virtual memory size in bytes.
    pub virtual_mem_bytes: u64,
}

/// Process resource probe backed by `sysinfo`.
///
/// When the current pid cannot be resolved (exotic platforms, sandboxes) the
/// probe stays disabled and every snapshot reads zero; request observation
/// continues regardless.
struct ResourceProbe {
    system: System,
    pid: Option<Pid>,
}

impl ResourceProbe {
    fn new() -> Self {
        let pid = match get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = %e, "Cannot resolve current pid; resource sampling disabled");
                None
            }
        };

        Self {
            system: System::new(),
            pid,
        }
    }

    fn snapshot(&mut self) -> ResourceSnapshot {
        let Some(pid) = self.pid else {
            return ResourceSnapshot::default();
        };

        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            false,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );

        match self.system.process(pid) {
            Some(process) => ResourceSnapshot {
                cpu_time_ms: process.accumulated_cpu_time(),
                rss_bytes: process.memory(),
                virtual_mem_bytes: process.virtual_memory(),
            },
            None => {
                debug!("Process entry missing from refresh; recording zeroed resources");
                ResourceSnapshot::default()
            }
        }
    }
}

/// Aggregate view over the current ring buffer contents. Computed on
/// demand, never stored.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateStats {
    pub total_requests: usize,
    pub average_duration_ms: f64,
    /// Fraction of samples with status >= 400, as a percentage.
    pub error_rate_percent: f64,
    /// Samples observed within the trailing 60 seconds.
    pub requests_per_minute: usize,
    /// Sample count grouped by status code.
    pub status_codes: BTreeMap<u16, u64>,
    /// Top endpoints by mean duration, descending, capped at 10.
    pub slowest_endpoints: Vec<EndpointStats>,
}

/// Per-endpoint aggregate, grouped by `METHOD path`.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub endpoint: String,
    pub average_duration_ms: f64,
    pub count: u64,
}

/// Cap on the `slowest_endpoints` list.
const SLOWEST_ENDPOINTS_CAP: usize = 10;

/// Minimum interval between process refreshes.
///
/// A `sysinfo` refresh reads the proc filesystem, too slow for the
/// per-request path. Snapshots between refreshes serve the cached figures.
const PROBE_REFRESH_INTERVAL: Duration = Duration::from_millis(250);

/// Probe plus the time of its last refresh, guarded as one unit.
struct ProbeState {
    probe: ResourceProbe,
    last_refresh: Option<Instant>,
}

/// Host-level figures for the metrics report.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SystemStats {
    pub total_memory_bytes: u64,
    pub free_memory_bytes: u64,
    pub load_average_1m: f64,
    pub load_average_5m: f64,
    pub load_average_15m: f64,
}

/// Bounded request sample collector.
pub struct MetricsCollector {
    samples: Mutex<VecDeque<RequestSample>>,
    probe: Mutex<ProbeState>,
    cached_snapshot: Mutex<ResourceSnapshot>,
    capacity: usize,
    slow_threshold: Duration,
}

impl MetricsCollector {
    /// Create a collector with the given ring buffer capacity and slow
    /// request threshold.
    pub fn new(capacity: usize, slow_threshold: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            probe: Mutex::new(ProbeState {
                probe: ResourceProbe::new(),
                last_refresh: None,
            }),
            cached_snapshot: Mutex::new(ResourceSnapshot::default()),
            capacity,
            slow_threshold,
        }
    }

    /// Read the process resource counters.
    ///
    /// The underlying probe refreshes at most once per
    /// [`PROBE_REFRESH_INTERVAL`], and only the caller holding the probe
    /// lock does so; everyone else reads the cached figures immediately.
    /// Concurrent requests therefore never queue behind a proc read.
    /// Per-request CPU deltas are resolved at the refresh granularity.
    pub fn resource_snapshot(&self) -> ResourceSnapshot {
        if let Ok(mut state) = self.probe.try_lock() {
            let due = state
                .last_refresh
                .is_none_or(|at| at.elapsed() >= PROBE_REFRESH_INTERVAL);
            if due {
                let snapshot = state.probe.snapshot();
                state.last_refresh = Some(Instant::now());
                *self
                    .cached_snapshot
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = snapshot;
            }
        }

        *self
            .cached_snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Host-level memory and load figures.
    ///
    /// Performs a memory refresh under the probe lock; called from the
    /// metrics report endpoint only, never the per-request path.
    pub fn system_stats(&self) -> SystemStats {
        let mut state = self.probe.lock().unwrap_or_else(PoisonError::into_inner);
        state.probe.system.refresh_memory();

        let load = System::load_average();
        SystemStats {
            total_memory_bytes: state.probe.system.total_memory(),
            free_memory_bytes: state.probe.system.free_memory(),
            load_average_1m: load.one,
            load_average_5m: load.five,
            load_average_15m: load.fifteen,
        }
    }

    /// Record one sample, evicting the oldest when the buffer is full.
    ///
    /// Also classifies the sample for logging severity: slow requests and
    /// error statuses log as warnings, everything else as info.
    pub fn record(&self, sample: RequestSample) {
        let slow = sample.duration_ms > self.slow_threshold.as_secs_f64() * 1000.0;

        if slow {
            warn!(
                request_id = %sample.request_id,
                method = %sample.method,
                path = %sample.path,
                status = sample.status,
                duration_ms = sample.duration_ms,
                cpu_time_ms = sample.cpu_time_ms,
                "Slow request detected"
            );
        } else if sample.status >= 400 {
            warn!(
                request_id = %sample.request_id,
                method = %sample.method,
                path = %sample.path,
                status = sample.status,
                duration_ms = sample.duration_ms,
                "Request failed"
            );
        } else {
            info!(
                request_id = %sample.request_id,
                method = %sample.method,
                path = %sample.path,
                status = sample.status,
                duration_ms = sample.duration_ms,
                "Request completed"
            );
        }

        // Push and evict as one atomic unit so the buffer never exceeds
        // capacity under concurrent recording.
        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        samples.push_back(sample);
        while samples.len() > self.capacity {
            samples.pop_front();
        }
    }

    /// The most recent samples, newest last, capped at `limit`.
    pub fn recent(&self, limit: usize) -> Vec<RequestSample> {
        let samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = samples.len().saturating_sub(limit);
        samples.iter().skip(skip).cloned().collect()
    }

    /// Number of samples currently held.
    pub fn len(&self) -> usize {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured ring buffer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Compute aggregate statistics over the current buffer contents.
    pub fn compute_stats(&self) -> AggregateStats {
        self.compute_stats_at(Utc::now())
    }

    /// Aggregation with an injectable clock for deterministic tests.
    pub fn compute_stats_at(&self, now: DateTime<Utc>) -> AggregateStats {
        let samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);

        if samples.is_empty() {
            return AggregateStats::default();
        }

        let total = samples.len();
        let mut duration_sum = 0.0f64;
        let mut errors = 0usize;
        let mut within_minute = 0usize;
        let mut status_codes: BTreeMap<u16, u64> = BTreeMap::new();
        let mut endpoints: HashMap<String, (f64, u64)> = HashMap::new();

        let minute_ago = now - chrono::TimeDelta::seconds(60);

        for sample in samples.iter() {
            duration_sum += sample.duration_ms;
            if sample.status >= 400 {
                errors += 1;
            }
            if sample.timestamp > minute_ago {
                within_minute += 1;
            }
            *status_codes.entry(sample.status).or_insert(0) += 1;

            let key = format!("{} {}", sample.method, sample.path);
            let entry = endpoints.entry(key).or_insert((0.0, 0));
            entry.0 += sample.duration_ms;
            entry.1 += 1;
        }

        let mut slowest: Vec<EndpointStats> = endpoints
            .into_iter()
            .map(|(endpoint, (sum, count))| EndpointStats {
                endpoint,
                average_duration_ms: sum / count as f64,
                count,
            })
            .collect();
        slowest.sort_by(|a, b| {
            b.average_duration_ms
                .partial_cmp(&a.average_duration_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        slowest.truncate(SLOWEST_ENDPOINTS_CAP);

        AggregateStats {
            total_requests: total,
            average_duration_ms: duration_sum / total as f64,
            error_rate_percent: errors as f64 / total as f64 * 100.0,
            requests_per_minute: within_minute,
            status_codes,
            slowest_endpoints: slowest,
        }
    }
}
