//! Host rotation and load accounting
//!
//! [`HostRing`] hands out hosts round-robin. [`HostTable`] tracks how many
//! transfers each host is serving and how much space it has left, so a
//! caller can prefer idle hosts and hold back entries whose hosts are all
//! busy (see [`crate::walker::DirTreeWalker::requeue_last`]).

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

/// How long [`HostTable::wait_for_unbusy`] waits for a slot to free up
pub const BUSY_WAIT: Duration = Duration::from_secs(1);

/// Round-robin iterator over a fixed host list
///
/// Rotation rule: each call starts scanning at the host after the one
/// returned last (initially the first host) and returns the first host the
/// predicate accepts. Ties are therefore broken by list order starting from
/// the cursor. Rejected hosts do not move the cursor; a full rotation with
/// no acceptable host returns `None` and leaves the cursor unchanged.
#[derive(Debug, Clone)]
pub struct HostRing {
    hosts: Vec<String>,
    cursor: usize,
}

impl HostRing {
    pub fn new(hosts: Vec<String>) -> Self {
        Self { hosts, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Next host in rotation accepted by `accept`
    pub fn next_matching(&mut self, mut accept: impl FnMut(&str) -> bool) -> Option<&str> {
        let n = self.hosts.len();
        for step in 0..n {
            let index = (self.cursor + step) % n;
            if accept(&self.hosts[index]) {
                self.cursor = (index + 1) % n;
                return Some(&self.hosts[index]);
            }
        }
        None
    }

    /// Up to `count` distinct hosts in rotation accepted by `accept`
    pub fn take(&mut self, count: usize, mut accept: impl FnMut(&str) -> bool) -> Vec<String> {
        let mut picked: Vec<String> = Vec::with_capacity(count);
        while picked.len() < count {
            let next = self
                .next_matching(|h| !picked.iter().any(|p| p == h) && accept(h))
                .map(str::to_string);
            match next {
                Some(h) => picked.push(h),
                None => break,
            }
        }
        picked
    }
}

impl Iterator for HostRing {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.next_matching(|_| true).map(str::to_string)
    }
}

/// Load and capacity of one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub name: String,
    /// Concurrent transfers this host should serve
    pub max_rw: usize,
    /// Transfers currently using this host
    pub n_using: usize,
    /// Free bytes, as last known
    pub disk_avail: u64,
    /// Bytes reserved by transfers that later failed, returned on next check
    pub failed_size: u64,
}

impl HostInfo {
    pub fn new(name: impl Into<String>, max_rw: usize, disk_avail: u64) -> Self {
        Self {
            name: name.into(),
            max_rw: max_rw.max(1),
            n_using: 0,
            disk_avail,
            failed_size: 0,
        }
    }

    fn load(&self) -> f64 {
        self.n_using as f64 / self.max_rw as f64
    }

    fn is_busy(&self) -> bool {
        self.n_using >= self.max_rw
    }
}

/// Shared host accounting, updated from transfer callbacks
#[derive(Debug, Default)]
pub struct HostTable {
    hosts: Mutex<HashMap<String, HostInfo>>,
    released: Condvar,
    minimum_free: u64,
}

impl HostTable {
    /// `minimum_free` bytes are kept free on every destination
    pub fn new(hosts: impl IntoIterator<Item = HostInfo>, minimum_free: u64) -> Self {
        Self {
            hosts: Mutex::new(hosts.into_iter().map(|h| (h.name.clone(), h)).collect()),
            released: Condvar::new(),
            minimum_free,
        }
    }

    pub fn get(&self, name: &str) -> Option<HostInfo> {
        self.hosts.lock().get(name).cloned()
    }

    /// Count one more transfer on `name`; with `reserve`, also deduct the
    /// bytes it will write
    pub fn acquire(&self, name: &str, reserve: u64) {
        if let Some(h) = self.hosts.lock().get_mut(name) {
            h.n_using += 1;
            h.disk_avail = h.disk_avail.saturating_sub(reserve);
        }
    }

    /// A transfer on `name` finished; `failed_size` bytes it reserved were
    /// never written
    pub fn release(&self, name: &str, failed_size: u64) {
        if let Some(h) = self.hosts.lock().get_mut(name) {
            h.n_using = h.n_using.saturating_sub(1);
            h.failed_size += failed_size;
        }
        self.released.notify_all();
    }

    /// Whether `name` can take `size` more bytes, keeping the minimum free
    ///
    /// Folds any failed reservations back into the free space first.
    pub fn check_disk_avail(&self, name: &str, size: u64) -> bool {
        let mut hosts = self.hosts.lock();
        match hosts.get_mut(name) {
            Some(h) => {
                h.disk_avail += std::mem::take(&mut h.failed_size);
                h.disk_avail >= size.saturating_add(self.minimum_free)
            }
            None => false,
        }
    }

    /// Order source candidates, least loaded first (stable)
    pub fn sort_for_src(&self, names: &mut [String]) {
        let hosts = self.hosts.lock();
        names.sort_by(|a, b| cmp_load(hosts.get(a), hosts.get(b)));
    }

    /// Order destination candidates: least loaded, then most free space
    pub fn sort_for_dst(&self, names: &mut [String]) {
        let hosts = self.hosts.lock();
        names.sort_by(|a, b| {
            cmp_load(hosts.get(a), hosts.get(b)).then_with(|| {
                let avail = |n: &String| hosts.get(n).map_or(0, |h| h.disk_avail);
                avail(b).cmp(&avail(a))
            })
        });
    }

    /// First candidate with room for `size` bytes and a free transfer slot
    ///
    /// With `no_limit`, falls back to the first candidate with room even if
    /// every one is busy.
    pub fn select_dst(&self, candidates: &[String], size: u64, no_limit: bool) -> Option<String> {
        let mut fallback = None;
        for name in candidates {
            if !self.check_disk_avail(name, size) {
                continue;
            }
            let busy = self.hosts.lock().get(name).map_or(true, HostInfo::is_busy);
            if !busy {
                return Some(name.clone());
            }
            if no_limit && fallback.is_none() {
                fallback = Some(name.clone());
            }
        }
        fallback
    }

    /// Whether at least `desired` of `names` have a free slot
    ///
    /// On an entry's first attempt (`n_pending == 0`) this never waits.
    /// Otherwise it waits up to [`BUSY_WAIT`] once for a release and
    /// rechecks. Returns `true` when the hosts are still busy.
    pub fn wait_for_unbusy(&self, names: &[String], desired: usize, n_pending: u32) -> bool {
        if desired == 0 {
            return false;
        }
        let desired = desired.min(names.len());
        let mut hosts = self.hosts.lock();
        let mut waited = false;
        loop {
            let unbusy = names
                .iter()
                .filter(|n| hosts.get(*n).map_or(false, |h| !h.is_busy()))
                .count();
            if unbusy >= desired {
                return false;
            }
            if waited || n_pending == 0 {
                return true;
            }
            if self.released.wait_for(&mut hosts, BUSY_WAIT).timed_out() {
                return true;
            }
            waited = true;
        }
    }
}

fn cmp_load(a: Option<&HostInfo>, b: Option<&HostInfo>) -> Ordering {
    let load = |h: Option<&HostInfo>| h.map_or(f64::MAX, HostInfo::load);
    load(a).partial_cmp(&load(b)).unwrap_or(Ordering::Equal)
}
