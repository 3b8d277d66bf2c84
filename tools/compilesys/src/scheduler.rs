/*!
The dispatcher/worker pool.

The dispatcher owns a per-fingerprint state table and feeds a work channel
whenever a pending fingerprint has all of its dependencies done; a fixed
pool of worker threads drains that channel, so at most `workers`
containers are ever live. Results flow back over a second channel. A
failure marks the fingerprint failed and cascades to every transitive
dependent without running them; everything else continues to completion,
and the call returns only once the pool is drained.
*/

use crate::cache::{CompilationCache, ARTIFACT_NAME};
use crate::error;
use crate::{CancelToken, Result};
use docker_cli_wrapper::{ContainerEngine, Mount, RunSpec};
use log::{debug, info, warn};
use releasesys::{PackageId, ReleaseSet};
use snafu::ResultExt;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Everything `compile` needs besides the graph itself.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Worker pool size; also the bound on live containers.
    pub workers: usize,
    /// Base OS image the compilation containers run.
    pub stemcell: String,
    /// Compilation cache root.
    pub cache_root: PathBuf,
    /// Leave the container behind when a compile fails, for debugging.
    pub keep_container_on_failure: bool,
    /// Network for the compilation containers; engine default when unset.
    pub network: Option<String>,
    /// Host uid/gid the container should write output as.
    pub host_user: Option<(u32, u32)>,
}

impl CompileOptions {
    pub fn new(stemcell: impl Into<String>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            workers: crate::default_worker_count(),
            stemcell: stemcell.into(),
            cache_root: cache_root.into(),
            keep_container_on_failure: false,
            network: None,
            host_user: None,
        }
    }
}

/// What happened to one fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Compiled in a container during this run.
    Built,
    /// The cache already held the artifact.
    CacheHit,
    /// The compile itself failed; the captured log tells why.
    Failed { logs: String },
    /// Not attempted because a dependency failed.
    DependencyFailed { dependency: String },
    /// Not attempted, or aborted, because the run was cancelled.
    Cancelled,
}

/// Per-fingerprint report. `names` lists every `release/package` that
/// shares the fingerprint; they are all served by the same artifact.
#[derive(Debug, Clone)]
pub struct PackageReport {
    pub fingerprint: String,
    pub names: Vec<String>,
    pub outcome: Outcome,
}

#[derive(Debug, Default)]
pub struct CompileReport {
    pub packages: Vec<PackageReport>,
}

impl CompileReport {
    pub fn is_ok(&self) -> bool {
        self.packages
            .iter()
            .all(|p| matches!(p.outcome, Outcome::Built | Outcome::CacheHit))
    }

    pub fn failures(&self) -> impl Iterator<Item = &PackageReport> {
        self.packages
            .iter()
            .filter(|p| !matches!(p.outcome, Outcome::Built | Outcome::CacheHit))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    InFlight,
    Done,
    Failed,
    Cancelled,
}

impl State {
    fn is_terminal(&self) -> bool {
        matches!(self, State::Done | State::Failed | State::Cancelled)
    }
}

/// One compilation unit: a fingerprint, the package that represents it,
/// and its edges within the fingerprint graph.
struct Node {
    representative: PackageId,
    names: Vec<String>,
    dependencies: BTreeSet<String>,
    dependents: BTreeSet<String>,
}

struct WorkItem {
    fingerprint: String,
    package: PackageId,
}

struct WorkResult {
    fingerprint: String,
    outcome: Outcome,
}

/// Compile every package reachable from `roots`. Returns only after the
/// worker pool is drained; per-package failures are reported, not raised.
pub fn compile(
    engine: &ContainerEngine,
    set: &ReleaseSet,
    roots: &[PackageId],
    options: &CompileOptions,
    cancel: &CancelToken,
) -> Result<CompileReport> {
    let cache = CompilationCache::new(&options.cache_root, &options.stemcell);
    cache.ensure_dirs()?;

    let nodes = build_nodes(set, roots);
    info!(
        "Compiling {} packages with {} workers",
        nodes.len(),
        options.workers
    );

    let mut states: HashMap<String, State> = nodes
        .keys()
        .map(|fingerprint| (fingerprint.clone(), State::Pending))
        .collect();
    let mut report = CompileReport::default();

    let (work_tx, work_rx) = mpsc::channel::<WorkItem>();
    let (result_tx, result_rx) = mpsc::channel::<WorkResult>();
    let work_rx = Arc::new(Mutex::new(work_rx));
    let live_containers: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

    thread::scope(|scope| {
        for _ in 0..options.workers.max(1) {
            let work_rx = Arc::clone(&work_rx);
            let result_tx = result_tx.clone();
            let live_containers = Arc::clone(&live_containers);
            let cache = cache.clone();
            scope.spawn(move || {
                worker_loop(
                    engine,
                    set,
                    options,
                    cancel,
                    &cache,
                    &work_rx,
                    &result_tx,
                    &live_containers,
                );
            });
        }
        drop(result_tx);

        dispatch_loop(
            engine,
            &nodes,
            &mut states,
            &mut report,
            work_tx,
            &result_rx,
            cancel,
            &live_containers,
        );
    });

    // The nodes map is ordered, so sorting by fingerprint keeps two runs
    // over the same inputs comparable.
    report
        .packages
        .sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
    Ok(report)
}

/// Collapse the package closure onto fingerprints. Two packages with the
/// same fingerprint are the same compilation unit.
fn build_nodes(set: &ReleaseSet, roots: &[PackageId]) -> BTreeMap<String, Node> {
    let closure = set.package_closure(roots);
    let mut nodes: BTreeMap<String, Node> = BTreeMap::new();

    for id in &closure {
        let package = set.package(*id);
        let node = nodes
            .entry(package.fingerprint.clone())
            .or_insert_with(|| Node {
                representative: *id,
                names: Vec::new(),
                dependencies: BTreeSet::new(),
                dependents: BTreeSet::new(),
            });
        node.names
            .push(format!("{}/{}", set.release(id.release).name, package.name));
        for dep in &package.dependencies {
            let dep_fingerprint = set.package(*dep).fingerprint.clone();
            if dep_fingerprint != package.fingerprint {
                node.dependencies.insert(dep_fingerprint);
            }
        }
    }

    let edges: Vec<(String, String)> = nodes
        .iter()
        .flat_map(|(fingerprint, node)| {
            node.dependencies
                .iter()
                .map(|dep| (dep.clone(), fingerprint.clone()))
                .collect::<Vec<_>>()
        })
        .collect();
    for (dependency, dependent) in edges {
        if let Some(node) = nodes.get_mut(&dependency) {
            node.dependents.insert(dependent);
        }
    }
    nodes
}

#[allow(clippy::too_many_arguments)]
fn dispatch_loop(
    engine: &ContainerEngine,
    nodes: &BTreeMap<String, Node>,
    states: &mut HashMap<String, State>,
    report: &mut CompileReport,
    work_tx: Sender<WorkItem>,
    result_rx: &Receiver<WorkResult>,
    cancel: &CancelToken,
    live_containers: &Mutex<HashSet<String>>,
) {
    let mut cancel_seen = false;

    loop {
        if cancel.is_cancelled() && !cancel_seen {
            cancel_seen = true;
            abort_live_containers(engine, live_containers);
        }

        if cancel_seen {
            // Nothing new runs; whatever has not started yet is cancelled.
            for (fingerprint, state) in states.iter_mut() {
                if *state == State::Pending {
                    *state = State::Cancelled;
                    report.packages.push(PackageReport {
                        fingerprint: fingerprint.clone(),
                        names: nodes[fingerprint].names.clone(),
                        outcome: Outcome::Cancelled,
                    });
                }
            }
        } else {
            let ready: Vec<String> = nodes
                .iter()
                .filter(|(fingerprint, node)| {
                    states[*fingerprint] == State::Pending
                        && node
                            .dependencies
                            .iter()
                            .all(|dep| states[dep] == State::Done)
                })
                .map(|(fingerprint, _)| fingerprint.clone())
                .collect();
            for fingerprint in ready {
                debug!("Dispatching package build for {}", fingerprint);
                states.insert(fingerprint.clone(), State::InFlight);
                let item = WorkItem {
                    package: nodes[&fingerprint].representative,
                    fingerprint,
                };
                if work_tx.send(item).is_err() {
                    // Worker pool died; results will stop flowing and the
                    // remaining states stay non-terminal.
                    warn!("Worker pool is gone; aborting dispatch");
                    return;
                }
            }
        }

        if states.values().all(State::is_terminal) {
            return;
        }

        match result_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(result) => handle_result(result, nodes, states, report),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn handle_result(
    result: WorkResult,
    nodes: &BTreeMap<String, Node>,
    states: &mut HashMap<String, State>,
    report: &mut CompileReport,
) {
    let node = &nodes[&result.fingerprint];
    let state = match &result.outcome {
        Outcome::Built | Outcome::CacheHit => State::Done,
        Outcome::Cancelled => State::Cancelled,
        Outcome::Failed { .. } | Outcome::DependencyFailed { .. } => State::Failed,
    };
    states.insert(result.fingerprint.clone(), state);

    if state == State::Failed {
        cascade_failure(&result.fingerprint, nodes, states, report);
    }

    report.packages.push(PackageReport {
        fingerprint: result.fingerprint,
        names: node.names.clone(),
        outcome: result.outcome,
    });
}

/// Mark every transitive dependent of `failed` as failed without running
/// it. Only pending fingerprints are touched; anything already in flight
/// does not depend on the failed one, or it would not have started.
fn cascade_failure(
    failed: &str,
    nodes: &BTreeMap<String, Node>,
    states: &mut HashMap<String, State>,
    report: &mut CompileReport,
) {
    let failed_name = nodes[failed]
        .names
        .first()
        .cloned()
        .unwrap_or_else(|| failed.to_string());

    let mut frontier: Vec<String> = nodes[failed].dependents.iter().cloned().collect();
    while let Some(fingerprint) = frontier.pop() {
        if states[&fingerprint] != State::Pending {
            continue;
        }
        warn!(
            "Not compiling {}: dependency {} failed",
            fingerprint, failed_name
        );
        states.insert(fingerprint.clone(), State::Failed);
        report.packages.push(PackageReport {
            fingerprint: fingerprint.clone(),
            names: nodes[&fingerprint].names.clone(),
            outcome: Outcome::DependencyFailed {
                dependency: failed_name.clone(),
            },
        });
        frontier.extend(nodes[&fingerprint].dependents.iter().cloned());
    }
}

fn abort_live_containers(engine: &ContainerEngine, live_containers: &Mutex<HashSet<String>>) {
    let names: Vec<String> = live_containers
        .lock()
        .map(|set| set.iter().cloned().collect())
        .unwrap_or_default();
    for name in names {
        warn!("Cancel requested, removing container '{}'", name);
        if let Err(e) = engine.remove_container(&name) {
            warn!("Failed to remove container '{}': {}", name, e);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    engine: &ContainerEngine,
    set: &ReleaseSet,
    options: &CompileOptions,
    cancel: &CancelToken,
    cache: &CompilationCache,
    work_rx: &Mutex<Receiver<WorkItem>>,
    result_tx: &Sender<WorkResult>,
    live_containers: &Mutex<HashSet<String>>,
) {
    loop {
        // Holding the lock while waiting is what shares one receiver
        // across the pool: exactly one idle worker gets the next item.
        let item = {
            let rx = match work_rx.lock() {
                Ok(rx) => rx,
                Err(_) => return,
            };
            match rx.recv() {
                Ok(item) => item,
                Err(_) => return,
            }
        };

        let outcome = if cancel.is_cancelled() {
            Outcome::Cancelled
        } else if cache.contains(&item.fingerprint) {
            debug!("Cache hit for {}", item.fingerprint);
            Outcome::CacheHit
        } else {
            match compile_one(engine, set, options, cancel, cache, &item, live_containers) {
                Ok(outcome) => outcome,
                Err(e) => {
                    cache.discard_staging(&item.fingerprint);
                    Outcome::Failed {
                        logs: e.to_string(),
                    }
                }
            }
        };

        let result = WorkResult {
            fingerprint: item.fingerprint,
            outcome,
        };
        if result_tx.send(result).is_err() {
            return;
        }
    }
}

// Mount points of the in-container build contract.
const SOURCE_MOUNT: &str = "/fissile-in/source.tgz";
const SCRIPT_MOUNT: &str = "/fissile-in/compile.sh";
const DEPS_MOUNT_DIR: &str = "/fissile-in/deps";
const OUTPUT_MOUNT: &str = "/fissile-out";

/// The compilation script run inside the container. Mirrors the BOSH
/// agent's compile step: unpack the source, lay out the compiled
/// dependencies, run `packaging`, and archive the install target into the
/// read-write output mount.
const COMPILE_SCRIPT: &str = r#"#!/bin/sh
set -e

mkdir -p /var/vcap/source "/var/vcap/data/packages/$PACKAGE_NAME"
tar -xzf /fissile-in/source.tgz -C /var/vcap/source

for dep in /fissile-in/deps/*.tgz; do
    [ -e "$dep" ] || continue
    name="$(basename "$dep" .tgz)"
    mkdir -p "/var/vcap/packages/$name"
    tar -xzf "$dep" -C "/var/vcap/packages/$name"
done

export BOSH_COMPILE_TARGET=/var/vcap/source
export BOSH_INSTALL_TARGET="/var/vcap/data/packages/$PACKAGE_NAME"
cd "$BOSH_COMPILE_TARGET"
if [ -f packaging ]; then
    sh packaging
fi

tar -czf /fissile-out/compiled.tgz -C "$BOSH_INSTALL_TARGET" .
"#;

#[allow(clippy::too_many_arguments)]
fn compile_one(
    engine: &ContainerEngine,
    set: &ReleaseSet,
    options: &CompileOptions,
    cancel: &CancelToken,
    cache: &CompilationCache,
    item: &WorkItem,
    live_containers: &Mutex<HashSet<String>>,
) -> Result<Outcome> {
    let package = set.package(item.package);
    info!(
        "Compiling {}/{} ({})",
        set.release(item.package.release).name,
        package.name,
        short(&item.fingerprint)
    );

    let scratch = tempfile::Builder::new()
        .prefix("fissile-compile-")
        .tempdir()
        .context(error::ScratchCreateSnafu {
            path: std::env::temp_dir(),
        })?;
    let script_path = scratch.path().join("compile.sh");
    fs::write(&script_path, COMPILE_SCRIPT).context(error::FileWriteSnafu {
        path: script_path.clone(),
    })?;
    let output_dir = scratch.path().join("out");
    fs::create_dir_all(&output_dir).context(error::DirectoryCreateSnafu {
        path: output_dir.clone(),
    })?;

    let mut mounts = vec![
        Mount::read_only(&package.path, SOURCE_MOUNT),
        Mount::read_only(&script_path, SCRIPT_MOUNT),
        Mount::read_write(&output_dir, OUTPUT_MOUNT),
    ];
    let mut seen_deps = HashSet::new();
    for dep in &package.dependencies {
        let dep_package = set.package(*dep);
        if !seen_deps.insert(&dep_package.fingerprint) {
            continue;
        }
        mounts.push(Mount::read_only(
            cache.artifact_path(&dep_package.fingerprint),
            format!("{}/{}.tgz", DEPS_MOUNT_DIR, dep_package.name),
        ));
    }

    let mut env = vec![("PACKAGE_NAME".to_string(), package.name.clone())];
    if let Some((uid, gid)) = options.host_user {
        env.push(("HOST_USERID".to_string(), uid.to_string()));
        env.push(("HOST_USERGID".to_string(), gid.to_string()));
    }

    let container_name = format!(
        "fissile-compile-{}-{}",
        short(&item.fingerprint),
        std::process::id()
    );
    let spec = RunSpec {
        image: options.stemcell.clone(),
        name: Some(container_name.clone()),
        command: vec!["sh".to_string(), SCRIPT_MOUNT.to_string()],
        mounts,
        env,
        network: options.network.clone(),
        user: options.host_user.map(|(uid, gid)| format!("{}:{}", uid, gid)),
    };

    if let Ok(mut live) = live_containers.lock() {
        live.insert(container_name.clone());
    }
    let run = engine.run_container(&spec);
    if let Ok(mut live) = live_containers.lock() {
        live.remove(&container_name);
    }
    let run = run.context(error::EngineSnafu)?;

    let failed = run.exit_code != 0;
    if !(failed && options.keep_container_on_failure) {
        let _ = engine.remove_container(&container_name);
    }

    if failed {
        if cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        return Ok(Outcome::Failed { logs: run.logs });
    }

    let artifact = output_dir.join(ARTIFACT_NAME);
    if !artifact.is_file() {
        return Ok(Outcome::Failed {
            logs: format!("container exited 0 but produced no {}", ARTIFACT_NAME),
        });
    }
    cache.store(&item.fingerprint, &artifact)?;
    Ok(Outcome::Built)
}

fn short(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(12)]
}
