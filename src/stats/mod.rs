//! L2: Stats Surface — shared, cross-process unsigned counters with
//! configured aggregation (§4.4).
//!
//! Slots live in a single anonymous `shmemfdrs`-backed mapping, sized at
//! plan-freeze time (§5, "Resource policy"). Each slot is a plain
//! `AtomicU64`; reads and writes are lock-free and atomic per counter,
//! matching the invariant in §4.4 ("no locks needed for these three
//! operations"). The mapping is created by the parent before the first
//! fork and inherited by every child through `fork()`, which is why no
//! locking protocol is required to share it — this mirrors how
//! `shmemfdrs::create_shmem` is already used elsewhere in this codebase
//! to hand a single shared region from parent to children.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// How per-scope bucket values are folded into an overall value when the
/// stats reporter reads them (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationKind {
    /// `worker-only` / `daemon-only`: no overall value is produced.
    WorkerOnly,
    Sum,
    Min,
    Max,
}

/// A single declared stat: its name and how it folds across scopes.
///
/// `zero_means_missing` implements the "0 means never set" trait used by
/// timestamp-like `min` stats such as `start_time` (§4.4).
#[derive(Debug, Clone)]
pub struct StatDeclaration {
    pub name: String,
    pub kind: AggregationKind,
    pub zero_means_missing: bool,
}

impl StatDeclaration {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: AggregationKind) -> Self {
        Self {
            name: name.into(),
            kind,
            zero_means_missing: false,
        }
    }

    #[must_use]
    pub fn timestamp(name: impl Into<String>, kind: AggregationKind) -> Self {
        Self {
            name: name.into(),
            kind,
            zero_means_missing: true,
        }
    }
}

/// Reserves slots for a set of (scope, name) pairs in a shared memory
/// region, sized once at plan-freeze and never resized while the parent
/// is alive (§5 "Resource policy").
pub struct StatsRegion {
    // Kept alive so the mapping isn't torn down; unused after mmap.
    _shmem_fd: std::os::unix::io::RawFd,
    slots: &'static [AtomicU64],
    index: HashMap<(String, String), usize>,
}

// SAFETY: `slots` points into a `MAP_SHARED` anonymous mapping that
// outlives every process holding a `StatsRegion`; every process reaches
// it after the same single `fork()` that copied this struct, so no
// process ever frees or remaps it independently.
unsafe impl Send for StatsRegion {}
unsafe impl Sync for StatsRegion {}

impl StatsRegion {
    /// Build the region from the full set of (scope, name) declarations
    /// that will ever be written. Must run before the first fork.
    pub fn allocate(slot_keys: &[(String, String)]) -> std::io::Result<Self> {
        let slot_count = slot_keys.len().max(1);
        let byte_len = slot_count * std::mem::size_of::<AtomicU64>();

        let name = std::ffi::CString::new("brimd-stats").unwrap();
        let fd = shmemfdrs::create_shmem(name, byte_len);
        if fd < 0 {
            return Err(std::io::Error::from_raw_os_error(-fd));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                byte_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        // Every slot starts zeroed by the kernel; AtomicU64 has the same
        // bit pattern as a plain zeroed u64, so this is a valid in-place
        // initialization of the whole region.
        let slots: &'static [AtomicU64] =
            unsafe { std::slice::from_raw_parts(ptr.cast::<AtomicU64>(), slot_count) };

        let index = slot_keys
            .iter()
            .enumerate()
            .map(|(i, key)| (key.clone(), i))
            .collect();

        Ok(Self {
            _shmem_fd: fd,
            slots,
            index,
        })
    }

    fn slot(&self, scope: &str, name: &str) -> Option<&AtomicU64> {
        self.index
            .get(&(scope.to_string(), name.to_string()))
            .map(|&i| &self.slots[i])
    }

    /// A write handle scoped to a single (scope) — what a worker or
    /// daemon process uses to update its own counters.
    #[must_use]
    pub fn handle_for_scope(self: &std::sync::Arc<Self>, scope: impl Into<String>) -> StatsHandle {
        StatsHandle {
            region: self.clone(),
            scope: scope.into(),
        }
    }

    /// Reset every slot belonging to `scope` to 0. Used when a worker
    /// restarts: its slot indices are reused, but the prior worker's
    /// values must not leak into the new incarnation (§3 Lifecycle).
    pub fn reset_scope(&self, scope: &str) {
        for ((slot_scope, _), &idx) in &self.index {
            if slot_scope == scope {
                self.slots[idx].store(0, Ordering::SeqCst);
            }
        }
    }

    /// Raw read, bypassing the "declared name" check — used by the
    /// aggregator, which already knows the declarations it is folding.
    #[must_use]
    pub fn raw_get(&self, scope: &str, name: &str) -> u64 {
        self.slot(scope, name)
            .map_or(0, |s| s.load(Ordering::SeqCst))
    }
}

/// Write-side handle: `get`/`set`/`incr` over one scope (§4.4 "Write side").
///
/// Undeclared names are silently ignored on write and read back as 0,
/// which keeps handlers forward-compatible with older plans.
#[derive(Clone)]
pub struct StatsHandle {
    region: std::sync::Arc<StatsRegion>,
    scope: String,
}

impl StatsHandle {
    #[must_use]
    pub fn get(&self, name: &str) -> u64 {
        self.region.raw_get(&self.scope, name)
    }

    /// Clamped to unsigned (negative inputs become 0) and truncated to
    /// 64 bits, per §3's StatBucket invariant.
    pub fn set(&self, name: &str, value: i64) {
        let v = value.max(0) as u64;
        if let Some(slot) = self.region.slot(&self.scope, name) {
            slot.store(v, Ordering::SeqCst);
        }
    }

    /// Saturating increment at `u64::MAX` (§4.4).
    pub fn incr(&self, name: &str) {
        if let Some(slot) = self.region.slot(&self.scope, name) {
            slot.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_add(1))
            })
            .ok();
        }
    }
}

/// Read-side aggregator (§4.4 "Read-side aggregator"): folds the
/// per-worker slots of a sub-instance into one JSON value.
pub struct Aggregator<'a> {
    region: &'a StatsRegion,
}

impl<'a> Aggregator<'a> {
    #[must_use]
    pub fn new(region: &'a StatsRegion) -> Self {
        Self { region }
    }

    /// `worker_scopes` lists the per-worker scope strings in index order
    /// (e.g. `wsgi:name:0`, `wsgi:name:1`, ...) or, for a daemon, the
    /// single `daemon:<name>` scope.
    #[must_use]
    pub fn aggregate(
        &self,
        worker_scopes: &[String],
        declarations: &[StatDeclaration],
    ) -> serde_json::Value {
        let mut per_worker = Vec::with_capacity(worker_scopes.len());
        for scope in worker_scopes {
            let mut obj = serde_json::Map::new();
            for decl in declarations {
                obj.insert(
                    decl.name.clone(),
                    serde_json::Value::from(self.region.raw_get(scope, &decl.name)),
                );
            }
            per_worker.push(serde_json::Value::Object(obj));
        }

        let mut result = serde_json::Map::new();
        for decl in declarations {
            if decl.kind == AggregationKind::WorkerOnly {
                continue;
            }
            let values: Vec<u64> = worker_scopes
                .iter()
                .map(|s| self.region.raw_get(s, &decl.name))
                .collect();
            if let Some(overall) = fold(decl, &values) {
                result.insert(decl.name.clone(), serde_json::Value::from(overall));
            }
        }
        for (i, worker) in per_worker.into_iter().enumerate() {
            result.insert(i.to_string(), worker);
        }
        serde_json::Value::Object(result)
    }
}

fn fold(decl: &StatDeclaration, values: &[u64]) -> Option<u64> {
    match decl.kind {
        AggregationKind::WorkerOnly => None,
        AggregationKind::Sum => Some(values.iter().fold(0u64, |acc, v| acc.saturating_add(*v))),
        AggregationKind::Max => values.iter().copied().max(),
        AggregationKind::Min => {
            let candidates: Vec<u64> = if decl.zero_means_missing {
                let non_zero: Vec<u64> = values.iter().copied().filter(|v| *v != 0).collect();
                if non_zero.is_empty() {
                    vec![0]
                } else {
                    non_zero
                }
            } else {
                values.to_vec()
            };
            candidates.into_iter().min()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn region_with(keys: &[(&str, &str)]) -> Arc<StatsRegion> {
        let owned: Vec<(String, String)> = keys
            .iter()
            .map(|(s, n)| (s.to_string(), n.to_string()))
            .collect();
        Arc::new(StatsRegion::allocate(&owned).unwrap())
    }

    #[test]
    fn incr_is_additive_and_saturating() {
        let region = region_with(&[("wsgi:a:0", "request_count")]);
        let handle = region.handle_for_scope("wsgi:a:0");
        for _ in 0..5 {
            handle.incr("request_count");
        }
        assert_eq!(handle.get("request_count"), 5);
    }

    #[test]
    fn set_clamps_negative_to_zero() {
        let region = region_with(&[("wsgi:a:0", "start_time")]);
        let handle = region.handle_for_scope("wsgi:a:0");
        handle.set("start_time", -10);
        assert_eq!(handle.get("start_time"), 0);
    }

    #[test]
    fn undeclared_name_is_silently_ignored() {
        let region = region_with(&[("wsgi:a:0", "request_count")]);
        let handle = region.handle_for_scope("wsgi:a:0");
        handle.incr("nonexistent");
        assert_eq!(handle.get("nonexistent"), 0);
    }

    #[test]
    fn sum_aggregation_adds_worker_slots() {
        let region = region_with(&[
            ("wsgi:a:0", "myapp.requests"),
            ("wsgi:a:1", "myapp.requests"),
        ]);
        region.handle_for_scope("wsgi:a:0").set("myapp.requests", 2);
        region.handle_for_scope("wsgi:a:1").set("myapp.requests", 1);

        let agg = Aggregator::new(&region);
        let decls = vec![StatDeclaration::new("myapp.requests", AggregationKind::Sum)];
        let result = agg.aggregate(
            &["wsgi:a:0".to_string(), "wsgi:a:1".to_string()],
            &decls,
        );
        assert_eq!(result["myapp.requests"], 3);
        assert_eq!(result["0"]["myapp.requests"], 2);
        assert_eq!(result["1"]["myapp.requests"], 1);
    }

    #[test]
    fn min_with_timestamp_trait_ignores_zero_unless_all_zero() {
        let region = region_with(&[("wsgi:a:0", "start_time"), ("wsgi:a:1", "start_time")]);
        region.handle_for_scope("wsgi:a:0").set("start_time", 0);
        region.handle_for_scope("wsgi:a:1").set("start_time", 42);

        let agg = Aggregator::new(&region);
        let decls = vec![StatDeclaration::timestamp(
            "start_time",
            AggregationKind::Min,
        )];
        let result = agg.aggregate(
            &["wsgi:a:0".to_string(), "wsgi:a:1".to_string()],
            &decls,
        );
        assert_eq!(result["start_time"], 42);
    }

    #[test]
    fn min_without_timestamp_trait_lets_zero_participate() {
        let region = region_with(&[("d:a:0", "myapp.last_called"), ("d:a:1", "myapp.last_called")]);
        region.handle_for_scope("d:a:0").set("myapp.last_called", 0);
        region.handle_for_scope("d:a:1").set("myapp.last_called", 42);

        let agg = Aggregator::new(&region);
        let decls = vec![StatDeclaration::new(
            "myapp.last_called",
            AggregationKind::Min,
        )];
        let result = agg.aggregate(&["d:a:0".to_string(), "d:a:1".to_string()], &decls);
        assert_eq!(result["myapp.last_called"], 0);
    }

    #[test]
    fn worker_only_has_no_overall_key() {
        let region = region_with(&[("daemon:a", "last_logged")]);
        region.handle_for_scope("daemon:a").set("last_logged", 7);
        let agg = Aggregator::new(&region);
        let decls = vec![StatDeclaration::new(
            "last_logged",
            AggregationKind::WorkerOnly,
        )];
        let result = agg.aggregate(&["daemon:a".to_string()], &decls);
        assert!(result.get("last_logged").is_none());
        assert_eq!(result["0"]["last_logged"], 7);
    }

    #[test]
    fn reset_scope_clears_only_that_scope() {
        let region = region_with(&[("wsgi:a:0", "request_count"), ("wsgi:a:1", "request_count")]);
        region.handle_for_scope("wsgi:a:0").set("request_count", 9);
        region.handle_for_scope("wsgi:a:1").set("request_count", 9);
        region.reset_scope("wsgi:a:0");
        assert_eq!(region.raw_get("wsgi:a:0", "request_count"), 0);
        assert_eq!(region.raw_get("wsgi:a:1", "request_count"), 9);
    }
}
