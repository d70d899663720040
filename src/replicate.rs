//! Replica placement across storage hosts
//!
//! [`Replicator`] looks at every regular file a walk produces and decides
//! what the file needs: more replicas up to the desired count, its replicas
//! moved off the source hosts (migration), or surplus replicas removed. The
//! transfers run on a [`TaskDispatcher`]; the shared [`HostTable`] keeps the
//! per-host transfer count and free space current from the completion
//! callbacks, so later files see the load earlier ones created.
//!
//! When every candidate host of a file is busy the file is put back with
//! [`DirTreeWalker::requeue_last`] and retried after the entries behind it.
//! Source replicas that were busy when a migration tried to remove them are
//! collected and removed once more by [`Replicator::finish`].

use crate::backend::Session;
use crate::dispatch::{Command, DispatchOptions, ReplicaTransfer, TaskDispatcher, TaskStatus};
use crate::engine::Engine;
use crate::error::{ConfigError, Result};
use crate::hosts::{HostInfo, HostRing, HostTable};
use crate::walker::{DirTreeEntry, DirTreeWalker};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Default number of concurrent transfers per host
pub const DEFAULT_MAX_RW: usize = 4;

/// What a replicate run should do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicateOptions {
    /// Desired replicas per file
    pub copies: usize,

    /// Move every replica held by a source host to a destination host
    pub migrate: bool,

    /// Remove replicas beyond `copies`
    pub remove_excess: bool,

    /// Read only from hosts in this domain
    pub src_domain: Option<String>,

    /// Write only to hosts in this domain
    pub dst_domain: Option<String>,

    /// Concurrent transfers per host
    pub max_rw: usize,

    /// Files smaller than this are skipped
    pub min_size: Option<u64>,

    /// Files larger than this are skipped
    pub max_size: Option<u64>,

    /// Stop scheduling once this many bytes are requested (less failures)
    pub max_total: Option<u64>,

    /// Bytes every destination keeps free beyond the file
    pub minimum_free: u64,
}

impl Default for ReplicateOptions {
    fn default() -> Self {
        Self {
            copies: 1,
            migrate: false,
            remove_excess: false,
            src_domain: None,
            dst_domain: None,
            max_rw: DEFAULT_MAX_RW,
            min_size: None,
            max_size: None,
            max_total: None,
            minimum_free: 0,
        }
    }
}

/// Callback data of one scheduled task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaTicket {
    /// Replicate or migrate; both hosts are counted busy until completion
    Transfer {
        path: String,
        size: u64,
        src_host: String,
        dst_host: String,
        migrate: bool,
    },
    /// Drop a surplus replica
    Removal { path: String, size: u64, host: String },
}

/// Outcome counters of a replicate run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicateStats {
    pub ok_files: u64,
    pub ok_bytes: u64,
    pub skipped_files: u64,
    pub skipped_bytes: u64,
    /// Files that could not be scheduled plus transfers that failed
    pub failed_files: u64,
    pub failed_bytes: u64,
    /// Bytes handed to the dispatcher
    pub requested_bytes: u64,
    pub removed: u64,
    pub remove_failed: u64,
    /// Busy source replicas removed by [`Replicator::finish`]
    pub deferred_removed: u64,
    pub deferred_failed: u64,
    /// Scheduling stopped at the byte limit
    pub limit_reached: bool,
}

impl ReplicateStats {
    pub fn failures(&self) -> u64 {
        self.failed_files + self.remove_failed + self.deferred_failed
    }
}

/// State the scheduler shares with the completion callbacks
#[derive(Debug)]
struct Shared {
    hosts: HostTable,
    stats: Mutex<ReplicateStats>,
    /// (path, host) source replicas a migration could not remove yet
    deferred: Mutex<Vec<(String, String)>>,
}

impl Shared {
    fn complete(&self, status: TaskStatus, ticket: ReplicaTicket) {
        match ticket {
            ReplicaTicket::Transfer {
                path,
                size,
                src_host,
                dst_host,
                migrate,
            } => {
                let replicated =
                    status.is_success() || status == TaskStatus::BusyRemoveSourceReplica;
                self.hosts.release(&src_host, 0);
                self.hosts.release(&dst_host, if replicated { 0 } else { size });

                {
                    let mut stats = self.stats.lock();
                    if replicated {
                        stats.ok_files += 1;
                        stats.ok_bytes += size;
                    } else {
                        stats.failed_files += 1;
                        stats.failed_bytes += size;
                    }
                }

                let op = if migrate { "migrate" } else { "replicate" };
                match status {
                    TaskStatus::BusyRemoveSourceReplica => {
                        info!(path = %path, host = %src_host, "Source replica busy; removed later");
                        self.deferred.lock().push((path, src_host));
                    }
                    _ if replicated => {
                        debug!(op, path = %path, src = %src_host, dst = %dst_host, "Done")
                    }
                    _ => {
                        warn!(op, path = %path, src = %src_host, dst = %dst_host, %status, "Failed")
                    }
                }
            }
            ReplicaTicket::Removal { path, host, .. } => {
                let mut stats = self.stats.lock();
                if status.is_success() {
                    stats.removed += 1;
                    debug!(path = %path, host = %host, "Replica removed");
                } else {
                    stats.remove_failed += 1;
                    warn!(path = %path, host = %host, %status, "Cannot remove replica");
                }
            }
        }
    }
}

/// What one file needs
#[derive(Debug, Clone, PartialEq, Eq)]
enum Plan {
    /// Directories and other non-files
    Ignore,
    Skip(&'static str),
    Fail(String),
    /// Every candidate host is busy; try again later
    Pending(&'static str),
    /// One transfer per destination, sources taken round-robin
    Transfer { src: Vec<String>, dst: Vec<String> },
    Remove(Vec<String>),
}

/// Schedules replication work for one tree
pub struct Replicator {
    session: Box<dyn Session>,
    root: String,
    options: ReplicateOptions,
    shared: Arc<Shared>,
    all_hosts: HashSet<String>,
    /// Hosts replicas may be read from when the source is limited
    src_hosts: HashSet<String>,
    /// Hosts replicas may be placed on, in schedule order
    dst_hosts: Vec<String>,
    /// Only files with a replica on a source host are considered
    limited_src: bool,
}

impl Replicator {
    /// Open a session, learn the hosts and their free space
    pub fn new(engine: &Engine, root: &str, options: ReplicateOptions) -> Result<Self> {
        let mut session = engine.connector().connect()?;

        let all = session.schedule_hosts(None)?;
        if all.is_empty() {
            return Err(ConfigError::NoAvailableHosts { role: "source" }.into());
        }
        let src_scope = match &options.src_domain {
            Some(domain) => session.schedule_hosts(Some(domain))?,
            None => all.clone(),
        };
        let dst_scope = match &options.dst_domain {
            Some(domain) => session.schedule_hosts(Some(domain))?,
            None => all.clone(),
        };

        // a host named by one side's domain is never used for the other
        let src_hosts: HashSet<String> = src_scope
            .iter()
            .filter(|h| options.dst_domain.is_none() || !dst_scope.contains(h))
            .cloned()
            .collect();
        let dst_hosts: Vec<String> = dst_scope
            .iter()
            .filter(|h| options.src_domain.is_none() || !src_scope.contains(h))
            .cloned()
            .collect();
        if src_hosts.is_empty() {
            return Err(ConfigError::NoAvailableHosts { role: "source" }.into());
        }
        if dst_hosts.is_empty() {
            return Err(ConfigError::NoAvailableHosts { role: "destination" }.into());
        }

        let mut infos = Vec::with_capacity(all.len());
        for host in &all {
            let avail = session.disk_avail(host).unwrap_or_else(|e| {
                warn!(error = %e, "Cannot get free space; host treated as full");
                0
            });
            infos.push(HostInfo::new(host.clone(), options.max_rw, avail));
        }
        info!(
            hosts = all.len(),
            sources = src_hosts.len(),
            destinations = dst_hosts.len(),
            "Host table ready"
        );

        let limited_src = options.src_domain.is_some() || options.migrate;
        Ok(Self {
            session,
            root: root.to_string(),
            shared: Arc::new(Shared {
                hosts: HostTable::new(infos, options.minimum_free),
                stats: Mutex::new(ReplicateStats::default()),
                deferred: Mutex::new(Vec::new()),
            }),
            all_hosts: all.into_iter().collect(),
            src_hosts,
            dst_hosts,
            limited_src,
            options,
        })
    }

    /// Host accounting shared with the dispatcher callbacks
    pub fn hosts(&self) -> &HostTable {
        &self.shared.hosts
    }

    pub fn stats(&self) -> ReplicateStats {
        *self.shared.stats.lock()
    }

    /// Start a dispatcher whose callbacks keep this replicator's host
    /// table and counters up to date
    pub fn start_dispatcher(
        &self,
        engine: &Engine,
        options: DispatchOptions,
    ) -> Result<TaskDispatcher<ReplicaTicket>> {
        let shared = Arc::clone(&self.shared);
        TaskDispatcher::start(
            engine,
            options,
            |ticket: &ReplicaTicket| debug!(?ticket, "Started"),
            move |status, ticket| shared.complete(status, ticket),
        )
    }

    /// Take entries from `walker` and submit what each file needs
    ///
    /// Returns when the walk is exhausted, the dispatcher is stopping or the
    /// byte limit is reached. Entries whose subpath `exclude` accepts are
    /// passed over.
    pub fn schedule(
        &mut self,
        walker: &DirTreeWalker,
        dispatcher: &TaskDispatcher<ReplicaTicket>,
        exclude: impl Fn(&str) -> bool,
    ) -> Result<()> {
        while let Some(entry) = walker.peek_next() {
            if dispatcher.is_stopping() {
                break;
            }
            if exclude(&entry.subpath) {
                walker.next();
                continue;
            }

            let plan = self.plan(&entry);
            if let Plan::Pending(reason) = plan {
                debug!(path = %entry.subpath, n_pending = entry.n_pending, reason, "pending");
                walker.requeue_last();
                continue;
            }
            walker.next();
            self.submit(plan, &entry, dispatcher)?;

            if self.limit_reached() {
                let mut stats = self.shared.stats.lock();
                stats.limit_reached = true;
                warn!(
                    requested = stats.requested_bytes,
                    limit = ?self.options.max_total,
                    "Byte limit reached; scheduling stopped"
                );
                break;
            }
        }
        Ok(())
    }

    fn limit_reached(&self) -> bool {
        let Some(limit) = self.options.max_total else {
            return false;
        };
        let stats = self.shared.stats.lock();
        stats.requested_bytes.saturating_sub(stats.failed_bytes) >= limit
    }

    fn plan(&self, entry: &DirTreeEntry) -> Plan {
        if !entry.is_file() {
            return Plan::Ignore;
        }
        let size = entry.src.size;
        if self.options.min_size.map_or(false, |min| size < min) {
            return Plan::Skip("smaller than the minimum size");
        }
        if self.options.max_size.map_or(false, |max| size > max) {
            return Plan::Skip("larger than the maximum size");
        }

        let replicas = &entry.src.replicas;
        let src_scope = if self.limited_src {
            &self.src_hosts
        } else {
            &self.all_hosts
        };
        if self.limited_src && !replicas.iter().any(|r| self.src_hosts.contains(r)) {
            return Plan::Skip("not a target file");
        }
        if replicas.is_empty() {
            return if size == 0 {
                Plan::Skip("empty file without replicas")
            } else {
                Plan::Fail("no available replica".into())
            };
        }

        let hosts = &self.shared.hosts;
        let mut src: Vec<String> =
            replicas.iter().filter(|r| src_scope.contains(*r)).cloned().collect();
        if src.is_empty() {
            return Plan::Fail("no available replica on a source host".into());
        }
        hosts.sort_for_src(&mut src);
        if hosts.wait_for_unbusy(&src, 1, entry.n_pending) {
            return Plan::Pending("source hosts are busy");
        }

        let mut existing = Vec::new();
        let mut candidates = Vec::new();
        for host in &self.dst_hosts {
            if replicas.contains(host) {
                existing.push(host.clone());
            } else if hosts.check_disk_avail(host, size) {
                candidates.push(host.clone());
            }
        }
        // surplus replicas go from the fullest host first
        existing.sort_by_key(|h| Reverse(hosts.get(h).map_or(0, |i| i.disk_avail)));
        hosts.sort_for_dst(&mut candidates);

        let wanted = self.options.copies as i64 - existing.len() as i64;
        let desired = wanted.max(0) as usize;
        if !candidates.is_empty() && hosts.wait_for_unbusy(&candidates, desired, entry.n_pending) {
            return Plan::Pending("destination hosts are busy");
        }

        if self.options.migrate {
            if candidates.len() < src.len() {
                return Plan::Fail(format!(
                    "insufficient number of destination hosts to migrate (src={}, dst={})",
                    src.len(),
                    candidates.len()
                ));
            }
            candidates.truncate(src.len());
            return Plan::Transfer { src, dst: candidates };
        }

        match wanted {
            0 => Plan::Skip("enough replicas"),
            w if w < 0 && !self.options.remove_excess => Plan::Skip("too many replicas"),
            w if w < 0 => {
                let surplus = w.unsigned_abs() as usize;
                Plan::Remove(existing.into_iter().rev().take(surplus).collect())
            }
            w if candidates.len() < w as usize => Plan::Fail(format!(
                "insufficient number of destination hosts to replicate (wanted={}, dst={})",
                w,
                candidates.len()
            )),
            w => {
                candidates.truncate(w as usize);
                Plan::Transfer { src, dst: candidates }
            }
        }
    }

    fn submit(
        &mut self,
        plan: Plan,
        entry: &DirTreeEntry,
        dispatcher: &TaskDispatcher<ReplicaTicket>,
    ) -> Result<()> {
        let path = entry.path_under(&self.root);
        let size = entry.src.size;
        match plan {
            Plan::Ignore | Plan::Pending(_) => {}
            Plan::Skip(reason) => {
                info!(path = %path, reason, "skip");
                let mut stats = self.shared.stats.lock();
                stats.skipped_files += 1;
                stats.skipped_bytes += size;
            }
            Plan::Fail(reason) => {
                error!(path = %path, %reason, "Cannot schedule");
                let mut stats = self.shared.stats.lock();
                stats.failed_files += 1;
                stats.failed_bytes += size;
            }
            Plan::Transfer { src, dst } => {
                let migrate = self.options.migrate;
                let mut ring = HostRing::new(src);
                for dst_host in dst {
                    let Some(src_host) = ring.next() else {
                        break;
                    };
                    self.shared.hosts.acquire(&src_host, 0);
                    self.shared.hosts.acquire(&dst_host, size);
                    self.shared.stats.lock().requested_bytes += size;

                    let transfer = ReplicaTransfer {
                        path: path.clone(),
                        size,
                        src_host: Some(src_host.clone()),
                        dst_host: dst_host.clone(),
                        check_disk_avail: false,
                    };
                    let command = if migrate {
                        Command::Migrate(transfer)
                    } else {
                        Command::Replicate(transfer)
                    };
                    let ticket = ReplicaTicket::Transfer {
                        path: path.clone(),
                        size,
                        src_host,
                        dst_host,
                        migrate,
                    };
                    dispatcher.submit(command, ticket)?;
                }
            }
            Plan::Remove(hosts) => {
                for host in hosts {
                    info!(path = %path, host = %host, "Removing surplus replica");
                    let command = Command::RemoveReplica {
                        path: path.clone(),
                        host: host.clone(),
                    };
                    let ticket = ReplicaTicket::Removal {
                        path: path.clone(),
                        size,
                        host,
                    };
                    dispatcher.submit(command, ticket)?;
                }
            }
        }
        Ok(())
    }

    /// Try once more to remove source replicas that were busy during
    /// migration; call after the dispatcher has joined
    pub fn finish(&mut self) -> ReplicateStats {
        let deferred = std::mem::take(&mut *self.shared.deferred.lock());
        for (path, host) in deferred {
            let removed = self.session.remove_replica(&path, &host);
            let mut stats = self.shared.stats.lock();
            match removed {
                Ok(()) => {
                    info!(path = %path, host = %host, "Removed a replica");
                    stats.deferred_removed += 1;
                }
                Err(e) => {
                    error!(error = %e, "Cannot remove a replica");
                    stats.deferred_failed += 1;
                }
            }
        }
        self.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn backend(hosts: &[&str]) -> MemoryBackend {
        let backend = MemoryBackend::new();
        for host in hosts {
            backend.add_host(host, 1 << 20);
        }
        backend
    }

    fn entry(backend: &MemoryBackend, path: &str) -> DirTreeEntry {
        let engine = Engine::new(backend.connector());
        let mut walker = DirTreeWalker::open(&engine, path, None, 1, 4, true).unwrap();
        walker.start().unwrap();
        let mut entries = walker.drain_to_vec().unwrap();
        entries.remove(0)
    }

    fn replicator(backend: &MemoryBackend, options: ReplicateOptions) -> Replicator {
        Replicator::new(&Engine::new(backend.connector()), "/", options).unwrap()
    }

    #[test]
    fn test_plan_adds_missing_replicas() {
        let backend = backend(&["h1", "h2", "h3"]);
        backend.add_replicated_file("/f", 10, &["h1"]);
        let r = replicator(
            &backend,
            ReplicateOptions {
                copies: 3,
                ..ReplicateOptions::default()
            },
        );

        let Plan::Transfer { src, mut dst } = r.plan(&entry(&backend, "/f")) else {
            panic!("expected a transfer");
        };
        dst.sort();
        assert_eq!(src, vec!["h1"]);
        assert_eq!(dst, vec!["h2", "h3"]);
    }

    #[test]
    fn test_plan_skips_and_removes() {
        let backend = backend(&["h1", "h2", "h3"]);
        backend.add_replicated_file("/f", 10, &["h1", "h2", "h3"]);
        backend.add_replicated_file("/small", 1, &["h1"]);

        let r = replicator(&backend, ReplicateOptions::default());
        assert_eq!(r.plan(&entry(&backend, "/f")), Plan::Skip("too many replicas"));

        let r = replicator(
            &backend,
            ReplicateOptions {
                copies: 2,
                remove_excess: true,
                min_size: Some(2),
                ..ReplicateOptions::default()
            },
        );
        let Plan::Remove(hosts) = r.plan(&entry(&backend, "/f")) else {
            panic!("expected a removal");
        };
        assert_eq!(hosts.len(), 1);
        assert_eq!(r.plan(&entry(&backend, "/small")), Plan::Skip("smaller than the minimum size"));
    }

    #[test]
    fn test_plan_fails_without_room() {
        let backend = MemoryBackend::new();
        backend.add_host("h1", 1 << 20);
        backend.add_host("h2", 5);
        backend.add_replicated_file("/f", 10, &["h1"]);
        backend.add_file("/lost", 10);

        let r = replicator(
            &backend,
            ReplicateOptions {
                copies: 2,
                ..ReplicateOptions::default()
            },
        );
        assert!(matches!(r.plan(&entry(&backend, "/f")), Plan::Fail(_)));
        assert_eq!(r.plan(&entry(&backend, "/lost")), Plan::Fail("no available replica".into()));
    }

    #[test]
    fn test_busy_hosts_leave_entry_pending() {
        let backend = backend(&["h1", "h2"]);
        backend.add_replicated_file("/f", 10, &["h1"]);
        let r = replicator(
            &backend,
            ReplicateOptions {
                copies: 2,
                max_rw: 1,
                ..ReplicateOptions::default()
            },
        );
        r.hosts().acquire("h2", 0);
        assert_eq!(r.plan(&entry(&backend, "/f")), Plan::Pending("destination hosts are busy"));
        r.hosts().release("h2", 0);
        assert!(matches!(r.plan(&entry(&backend, "/f")), Plan::Transfer { .. }));
    }

    #[test]
    fn test_domains_split_hosts() {
        let backend = backend(&["a.old", "b.old", "c.new"]);
        let r = replicator(
            &backend,
            ReplicateOptions {
                migrate: true,
                src_domain: Some(".old".into()),
                ..ReplicateOptions::default()
            },
        );
        assert_eq!(r.dst_hosts, vec!["c.new"]);
        assert_eq!(r.src_hosts.len(), 2);
        assert!(r.limited_src);

        let empty = Engine::new(MemoryBackend::new().connector());
        let err = Replicator::new(&empty, "/", ReplicateOptions::default());
        assert!(matches!(
            err,
            Err(crate::error::EngineError::Config(ConfigError::NoAvailableHosts { .. }))
        ));
    }
}
