//! Dependency-ordered startup and shutdown
//!
//! Collections declare which other collections they depend on. The
//! scheduler validates the declarations at construction (unknown names and
//! cycles fail fast), computes topological waves, and runs each wave's
//! collections in parallel: dependencies start before their dependents,
//! and shut down after them.

use crate::collection::CollectionHandle;
use crate::task::spawn_op;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tierdb_core::{Error, Result};
use tracing::{debug, info};

/// Topological wave runner over a set of collections
pub struct DependencyScheduler {
    // Waves in start order; each wave's collections are independent
    waves: Vec<Vec<Arc<dyn CollectionHandle>>>,
}

impl std::fmt::Debug for DependencyScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let waves: Vec<Vec<&str>> = self
            .waves
            .iter()
            .map(|wave| wave.iter().map(|h| h.name()).collect())
            .collect();
        f.debug_struct("DependencyScheduler")
            .field("waves", &waves)
            .finish()
    }
}

impl DependencyScheduler {
    /// Validate the dependency graph and precompute the waves.
    ///
    /// # Errors
    ///
    /// `UnknownDependency` if a declared dependency names no handle;
    /// `DependencyCycle` if the declarations are not acyclic.
    pub fn new(handles: Vec<Arc<dyn CollectionHandle>>) -> Result<Self> {
        let index: FxHashMap<&str, usize> = handles
            .iter()
            .enumerate()
            .map(|(i, h)| (h.name(), i))
            .collect();

        let mut in_degree = vec![0usize; handles.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); handles.len()];
        for (i, handle) in handles.iter().enumerate() {
            for dep in handle.dependencies() {
                let Some(&dep_index) = index.get(dep.as_str()) else {
                    return Err(Error::UnknownDependency {
                        collection: handle.name().to_string(),
                        dependency: dep.clone(),
                    });
                };
                dependents[dep_index].push(i);
                in_degree[i] += 1;
            }
        }

        // Kahn's algorithm, layer by layer
        let mut waves = Vec::new();
        let mut ready: Vec<usize> = (0..handles.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut placed = 0;
        while !ready.is_empty() {
            let mut next = Vec::new();
            for &i in &ready {
                placed += 1;
                for &dependent in &dependents[i] {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            waves.push(
                ready
                    .iter()
                    .map(|&i| Arc::clone(&handles[i]))
                    .collect::<Vec<_>>(),
            );
            ready = next;
        }

        if placed != handles.len() {
            let stuck = handles
                .iter()
                .enumerate()
                .filter(|&(i, _)| in_degree[i] > 0)
                .map(|(_, h)| h.name().to_string())
                .collect();
            return Err(Error::DependencyCycle(stuck));
        }

        Ok(DependencyScheduler { waves })
    }

    /// Number of waves
    pub fn wave_count(&self) -> usize {
        self.waves.len()
    }

    /// Names wave by wave, in start order (diagnostics)
    pub fn wave_names(&self) -> Vec<Vec<String>> {
        self.waves
            .iter()
            .map(|wave| wave.iter().map(|h| h.name().to_string()).collect())
            .collect()
    }

    /// Start every collection, dependencies first.
    ///
    /// Collections within a wave start in parallel. With a `timeout`, each
    /// wave must finish before the shared deadline; on expiry the
    /// remaining waves are skipped, but collections that already started
    /// stay started.
    ///
    /// # Errors
    ///
    /// `Timeout` on deadline expiry; the first `start` error otherwise.
    pub fn start_all(&self, timeout: Option<Duration>) -> Result<()> {
        info!(waves = self.waves.len(), "starting collections");
        self.run(self.waves.iter(), timeout, |handle| handle.start())
    }

    /// Shut every collection down, dependents first (reverse wave order).
    ///
    /// # Errors
    ///
    /// `Timeout` on deadline expiry; the first `shutdown` error otherwise.
    pub fn shutdown_all(&self, timeout: Option<Duration>) -> Result<()> {
        info!(waves = self.waves.len(), "shutting down collections");
        self.run(self.waves.iter().rev(), timeout, |handle| handle.shutdown())
    }

    fn run<'a, I, F>(&self, waves: I, timeout: Option<Duration>, op: F) -> Result<()>
    where
        I: Iterator<Item = &'a Vec<Arc<dyn CollectionHandle>>>,
        F: Fn(&dyn CollectionHandle) -> Result<()> + Send + Sync + Copy + 'static,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        for wave in waves {
            debug!(size = wave.len(), "running wave");
            let pendings: Vec<_> = wave
                .iter()
                .map(|handle| {
                    let handle = Arc::clone(handle);
                    spawn_op(move || {
                        let name = handle.name().to_string();
                        (name, op(handle.as_ref()))
                    })
                })
                .collect();
            for pending in pendings {
                let (name, result) = match deadline {
                    Some(deadline) => {
                        let now = Instant::now();
                        let remaining = deadline.saturating_duration_since(now);
                        match pending.wait_timeout(remaining) {
                            Some(completed) => completed,
                            None => {
                                return Err(Error::Timeout(
                                    "collection wave missed its deadline".to_string(),
                                ))
                            }
                        }
                    }
                    None => pending.wait(),
                };
                result.map_err(|e| {
                    tracing::error!(collection = %name, error = %e, "lifecycle operation failed");
                    e
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeCollection {
        name: String,
        dependencies: Vec<String>,
        running: AtomicBool,
        log: Arc<Mutex<Vec<String>>>,
        start_delay: Duration,
    }

    impl FakeCollection {
        fn new(name: &str, deps: &[&str], log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(FakeCollection {
                name: name.to_string(),
                dependencies: deps.iter().map(|s| s.to_string()).collect(),
                running: AtomicBool::new(false),
                log,
                start_delay: Duration::ZERO,
            })
        }

        fn slow(name: &str, delay: Duration, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(FakeCollection {
                name: name.to_string(),
                dependencies: Vec::new(),
                running: AtomicBool::new(false),
                log,
                start_delay: delay,
            })
        }
    }

    impl CollectionHandle for FakeCollection {
        fn name(&self) -> &str {
            &self.name
        }
        fn dependencies(&self) -> &[String] {
            &self.dependencies
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
        fn start(&self) -> Result<()> {
            std::thread::sleep(self.start_delay);
            self.running.store(true, Ordering::SeqCst);
            self.log.lock().push(format!("start:{}", self.name));
            Ok(())
        }
        fn shutdown(&self) -> Result<()> {
            self.running.store(false, Ordering::SeqCst);
            self.log.lock().push(format!("stop:{}", self.name));
            Ok(())
        }
        fn cache_size(&self) -> usize {
            0
        }
        fn cached_key_strings(&self, _limit: usize) -> Vec<String> {
            Vec::new()
        }
    }

    fn position(log: &[String], entry: &str) -> usize {
        log.iter().position(|e| e == entry).unwrap()
    }

    #[test]
    fn test_dependencies_start_first_and_stop_last() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let users = FakeCollection::new("users", &[], Arc::clone(&log));
        let orders = FakeCollection::new("orders", &["users"], Arc::clone(&log));
        let audits = FakeCollection::new("audits", &["orders"], Arc::clone(&log));

        let scheduler = DependencyScheduler::new(vec![users as Arc<dyn CollectionHandle>, orders, audits]).unwrap();
        assert_eq!(scheduler.wave_count(), 3);

        scheduler.start_all(None).unwrap();
        scheduler.shutdown_all(None).unwrap();

        let log = log.lock();
        assert!(position(&log, "start:users") < position(&log, "start:orders"));
        assert!(position(&log, "start:orders") < position(&log, "start:audits"));
        assert!(position(&log, "stop:audits") < position(&log, "stop:orders"));
        assert!(position(&log, "stop:orders") < position(&log, "stop:users"));
    }

    #[test]
    fn test_independent_collections_share_a_wave() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = FakeCollection::new("a", &[], Arc::clone(&log));
        let b = FakeCollection::new("b", &[], Arc::clone(&log));
        let c = FakeCollection::new("c", &["a", "b"], Arc::clone(&log));

        let scheduler = DependencyScheduler::new(vec![a as Arc<dyn CollectionHandle>, b, c]).unwrap();
        assert_eq!(scheduler.wave_count(), 2);
        assert_eq!(scheduler.wave_names()[1], vec!["c".to_string()]);
    }

    #[test]
    fn test_unknown_dependency_fails_fast() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = FakeCollection::new("a", &["ghost"], log);
        let err = DependencyScheduler::new(vec![a as Arc<dyn CollectionHandle>]).unwrap_err();
        match err {
            Error::UnknownDependency {
                collection,
                dependency,
            } => {
                assert_eq!(collection, "a");
                assert_eq!(dependency, "ghost");
            }
            _ => panic!("expected unknown dependency error"),
        }
    }

    #[test]
    fn test_cycle_fails_fast() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = FakeCollection::new("a", &["b"], Arc::clone(&log));
        let b = FakeCollection::new("b", &["a"], log);
        let err = DependencyScheduler::new(vec![a as Arc<dyn CollectionHandle>, b]).unwrap_err();
        match err {
            Error::DependencyCycle(names) => {
                assert_eq!(names.len(), 2);
                assert!(names.contains(&"a".to_string()));
                assert!(names.contains(&"b".to_string()));
            }
            _ => panic!("expected cycle error"),
        }
    }

    #[test]
    fn test_wave_deadline_expires() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let slow = FakeCollection::slow("slow", Duration::from_millis(200), log);
        let scheduler = DependencyScheduler::new(vec![slow as Arc<dyn CollectionHandle>]).unwrap();

        let err = scheduler
            .start_all(Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_partial_progress_survives_timeout() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fast = FakeCollection::new("fast", &[], Arc::clone(&log));
        let fast_handle = Arc::clone(&fast);

        // gated depends on fast, so it runs in a later wave and blows the
        // deadline there
        let gated: Arc<FakeCollection> = Arc::new(FakeCollection {
            name: "gated".to_string(),
            dependencies: vec!["fast".to_string()],
            running: AtomicBool::new(false),
            log: Arc::clone(&log),
            start_delay: Duration::from_millis(300),
        });
        let scheduler = DependencyScheduler::new(vec![fast as Arc<dyn CollectionHandle>, gated]).unwrap();

        let err = scheduler
            .start_all(Some(Duration::from_millis(50)))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        // The first wave completed and is not rolled back
        assert!(fast_handle.is_running());
    }
}
