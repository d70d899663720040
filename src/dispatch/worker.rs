//! Worker routine for the dispatcher: executes one command per request

use super::command::{Command, FileCopy, ReplicaTransfer, TaskStatus, OP_TERMINATE};
use super::DispatchOptions;
use crate::backend::{io_error, Connector, FileSink, FileStat, WorkerSession};
use crate::error::{BackendError, BackendErrorKind, BackendResult, WireError, WireResult};
use crate::pool::{Frame, WorkerEndpoint, WorkerLog};
use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Suffix of the temporary name a copy is written under
pub const TMP_SUFFIX: &str = "__tmp_bulkmove__";

/// What every dispatcher worker needs to know
pub(crate) struct TaskContext {
    pub connector: Arc<dyn Connector>,
    pub options: DispatchOptions,
}

/// Worker main loop
pub(crate) fn run(ctx: &TaskContext, mut ep: WorkerEndpoint) -> WireResult<()> {
    let mut session = match WorkerSession::open(Arc::clone(&ctx.connector)) {
        Ok(s) => s,
        Err(e) => {
            ep.log.error(format_args!("connect failed: {}", e));
            return Ok(());
        }
    };

    loop {
        let opcode = match ep.requests.get_i32() {
            Ok(op) => op,
            Err(WireError::UnexpectedEof) => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut reply = Frame::new();
        if opcode == OP_TERMINATE {
            reply.put_i32(TaskStatus::End.to_wire());
            ep.reply(&reply)?;
            return Ok(());
        }

        let command = Command::decode(opcode, &mut ep.requests)?;
        let mut task = Task {
            options: &ctx.options,
            session: &mut session,
            log: &mut ep.log,
        };
        let status = task.execute(&command);
        reply.put_i32(status.to_wire());
        ep.reply(&reply)?;
    }
}

/// Temporary path a copy to `dst` is written under
pub fn tmp_path(dst: &str) -> String {
    format!("{}{}", dst, TMP_SUFFIX)
}

struct Task<'a> {
    options: &'a DispatchOptions,
    session: &'a mut WorkerSession,
    log: &'a mut WorkerLog,
}

impl Task<'_> {
    fn execute(&mut self, command: &Command) -> TaskStatus {
        if self.options.simulate_rate > 0 {
            self.simulate(command);
            return TaskStatus::Ok;
        }

        match command {
            Command::Replicate(t) => self.replicate(t, false),
            Command::Migrate(t) => self.replicate(t, true),
            Command::Copy(c) => self.copy(c),
            Command::Move(c) => match self.copy(c) {
                TaskStatus::Ok => self.unlink_source(c),
                other => other,
            },
            Command::RemoveReplica { path, host } => self.remove_replica(path, host),
        }
    }

    /// Sleep as long as moving the command's bytes at the simulated rate
    fn simulate(&mut self, command: &Command) {
        let rate = self.options.simulate_rate as f64 * 1000.0;
        let secs = command.size() as f64 / rate;
        self.log.debug(format_args!(
            "simulate {} {} ({:.3}s)",
            command.operation(),
            command.path(),
            secs
        ));
        thread::sleep(Duration::from_secs_f64(secs));
    }

    /// Run `attempt` until it succeeds, fails for good, or the retry budget
    /// is spent. Attempts after the first get `retrying = true`.
    fn with_retries<T>(
        &mut self,
        what: &str,
        mut attempt: impl FnMut(&mut Self, bool) -> BackendResult<T>,
    ) -> BackendResult<T> {
        let mut retries = 0;
        loop {
            match attempt(self, retries > 0) {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retried_by_task() && retries < self.options.retry_max => {
                    retries += 1;
                    self.log.warn(&e);
                    self.log.info(format_args!(
                        "retry {} ({} of {})",
                        what, retries, self.options.retry_max
                    ));
                    thread::sleep(self.options.retry_delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fail with NoSpace unless `host` has room for `size` plus the reserve
    fn check_disk_avail(&mut self, path: &str, host: &str, size: u64) -> BackendResult<()> {
        let avail = self.session.call(self.log, |s| s.disk_avail(host))?;
        let needed = size.saturating_add(self.options.minimum_free);
        if avail < needed {
            return Err(BackendError::new(BackendErrorKind::NoSpace, "disk_avail", path)
                .with_host(host)
                .with_message(format!("{} bytes free, {} needed", avail, needed)));
        }
        Ok(())
    }

    fn replicate(&mut self, t: &ReplicaTransfer, migrate: bool) -> TaskStatus {
        if t.check_disk_avail {
            if let Err(e) = self.check_disk_avail(&t.path, &t.dst_host, t.size) {
                self.log.error(format_args!("cannot replicate: {}", e));
                return TaskStatus::Failed;
            }
        }

        let replicated = self.with_retries("replication", |task, _| {
            task.session
                .call(task.log, |s| s.replicate(&t.path, t.src_host.as_deref(), &t.dst_host))
        });
        if let Err(e) = replicated {
            self.log.error(format_args!("cannot replicate: {}", e));
            return TaskStatus::Failed;
        }
        if !migrate {
            return TaskStatus::Ok;
        }

        let Some(src_host) = t.src_host.as_deref() else {
            self.log.error(format_args!("cannot migrate {}: no source host", t.path));
            return TaskStatus::Failed;
        };
        let mut removed = self.session.call(self.log, |s| s.remove_replica(&t.path, src_host));
        if matches!(&removed, Err(e) if e.kind == BackendErrorKind::Busy) {
            thread::sleep(self.options.busy_wait);
            removed = self.session.call(self.log, |s| s.remove_replica(&t.path, src_host));
        }
        match removed {
            Ok(()) => TaskStatus::Ok,
            Err(e) if e.kind == BackendErrorKind::Busy => {
                self.log.info(format_args!("remove a replica later: {}", e));
                TaskStatus::BusyRemoveSourceReplica
            }
            Err(e) => {
                self.log.error(format_args!("cannot remove a replica: {}", e));
                TaskStatus::Failed
            }
        }
    }

    fn remove_replica(&mut self, path: &str, host: &str) -> TaskStatus {
        match self.session.call(self.log, |s| s.remove_replica(path, host)) {
            Ok(()) => TaskStatus::Ok,
            // removing surplus replicas down to the minimum is the intent
            Err(e) if e.kind == BackendErrorKind::InsufficientReplicas => {
                self.log.debug(&e);
                TaskStatus::Ok
            }
            Err(e) => {
                self.log.error(format_args!("cannot remove replica: {}", e));
                TaskStatus::Failed
            }
        }
    }

    fn unlink_source(&mut self, c: &FileCopy) -> TaskStatus {
        match self.session.call(self.log, |s| s.unlink(&c.src)) {
            Ok(()) => TaskStatus::Ok,
            Err(e) => {
                self.log.error(format_args!("move: copied but cannot remove source: {}", e));
                TaskStatus::Failed
            }
        }
    }

    fn copy(&mut self, c: &FileCopy) -> TaskStatus {
        let result = self.with_retries("copying", |task, retrying| {
            // a retry lets the backend pick any hosts
            task.copy_once(c, retrying)
        });
        match result {
            Ok(status) => status,
            Err(e) => {
                self.log.error(format_args!("copy failed: {}", e));
                TaskStatus::Failed
            }
        }
    }

    fn copy_once(&mut self, c: &FileCopy, retrying: bool) -> BackendResult<TaskStatus> {
        let (src_host, dst_host) = if retrying {
            (None, None)
        } else {
            (c.src_host.as_deref(), c.dst_host.as_deref())
        };

        let src_stat = self.session.call(self.log, |s| s.stat_path(&c.src))?;

        if c.skip_existing {
            match self.session.call(self.log, |s| s.stat_path(&c.dst)) {
                Ok(dst) if dst.size == src_stat.size && dst.mtime.sec == src_stat.mtime.sec => {
                    self.log.debug(format_args!("{}: up to date", c.dst));
                    return Ok(TaskStatus::Skipped);
                }
                Ok(_) => {}
                Err(e) if e.kind == BackendErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        if let (Some(host), true, false) = (dst_host, c.check_disk_avail, retrying) {
            self.check_disk_avail(&c.dst, host, src_stat.size)?;
        }

        let tmp = tmp_path(&c.dst);
        let perms = src_stat.permissions() & 0o777;
        let created = self
            .session
            .call(self.log, |s| s.create(&tmp, perms, c.skip_existing, dst_host));
        let sink = match created {
            Ok(sink) => sink,
            // another copier got there first
            Err(e) if c.skip_existing && e.kind == BackendErrorKind::AlreadyExists => {
                self.log.debug(&e);
                return Ok(TaskStatus::Skipped);
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = self.publish(c, src_host, &src_stat, sink, &tmp) {
            if let Err(cleanup) = self.session.call(self.log, |s| s.unlink(&tmp)) {
                if cleanup.kind != BackendErrorKind::NotFound {
                    self.log.error(format_args!("cannot remove tmp-file: {}", cleanup));
                }
            }
            return Err(e);
        }
        Ok(TaskStatus::Ok)
    }

    /// Fill the temporary file, then give it the source's times and move it
    /// into place
    fn publish(
        &mut self,
        c: &FileCopy,
        src_host: Option<&str>,
        src_stat: &FileStat,
        mut sink: Box<dyn FileSink>,
        tmp: &str,
    ) -> BackendResult<()> {
        if src_stat.size > 0 {
            let copied = self.copy_bytes(&c.src, src_host, sink.as_mut(), tmp)?;
            if copied != src_stat.size {
                self.log.warn(format_args!(
                    "{}: copied {} bytes, expected {}",
                    c.src, copied, src_stat.size
                ));
            }
        }
        sink.sync().map_err(|e| io_error("sync", tmp, &e))?;
        drop(sink);

        self.session
            .call(self.log, |s| s.set_times(tmp, src_stat.atime, src_stat.mtime))?;
        self.session.call(self.log, |s| s.rename(tmp, &c.dst))
    }

    /// Stream the source into `sink` through a buffer of the configured size
    fn copy_bytes(
        &mut self,
        src: &str,
        src_host: Option<&str>,
        sink: &mut dyn FileSink,
        tmp: &str,
    ) -> BackendResult<u64> {
        let mut reader = self.session.call(self.log, |s| s.open_read(src, src_host))?;
        let mut buf = vec![0u8; self.options.buffer_size];
        let mut total = 0u64;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => return Ok(total),
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(io_error("read", src, &e)),
            };
            sink.write_all(&buf[..n]).map_err(|e| io_error("write", tmp, &e))?;
            total += n as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, Timespec};
    use crate::pool::pipe;

    fn options() -> DispatchOptions {
        DispatchOptions {
            retry_delay: Duration::from_millis(1),
            busy_wait: Duration::from_millis(1),
            buffer_size: 7,
            ..DispatchOptions::default()
        }
    }

    fn execute(
        backend: &MemoryBackend,
        options: &DispatchOptions,
        command: &Command,
    ) -> TaskStatus {
        let (w, _r) = pipe();
        let mut log = WorkerLog::new(w);
        let mut session = WorkerSession::open(Arc::new(backend.connector())).unwrap();
        let mut task = Task {
            options,
            session: &mut session,
            log: &mut log,
        };
        task.execute(command)
    }

    #[test]
    fn test_copy_preserves_data_and_times() {
        let backend = MemoryBackend::new();
        backend.add_file("/a/f", 100);
        backend.set_mtime("/a/f", Timespec::new(1_600_000_000, 42));
        backend.mkdir_all("/b");

        let command = Command::Copy(FileCopy::new("/a/f", "/b/f", 100));
        let status = execute(&backend, &options(), &command);
        assert_eq!(status, TaskStatus::Ok);
        assert_eq!(backend.read_file("/b/f"), backend.read_file("/a/f"));
        assert_eq!(backend.stat("/b/f").unwrap().mtime, Timespec::new(1_600_000_000, 42));
        assert!(!backend.exists(&tmp_path("/b/f")));
        assert!(backend.exists("/a/f"));
    }

    #[test]
    fn test_move_unlinks_source() {
        let backend = MemoryBackend::new();
        backend.add_file("/a/f", 3);
        backend.mkdir_all("/b");
        let command = Command::Move(FileCopy::new("/a/f", "/b/f", 3));
        let status = execute(&backend, &options(), &command);
        assert_eq!(status, TaskStatus::Ok);
        assert!(!backend.exists("/a/f"));
        assert_eq!(backend.read_file("/b/f").unwrap().len(), 3);
    }

    #[test]
    fn test_copy_failure_removes_temporary() {
        let backend = MemoryBackend::new();
        backend.add_file("/a/f", 10);
        backend.mkdir_all("/b");
        backend.inject_fault("rename", None, BackendErrorKind::Other, 10);

        let command = Command::Copy(FileCopy::new("/a/f", "/b/f", 10));
        let status = execute(&backend, &options(), &command);
        assert_eq!(status, TaskStatus::Failed);
        assert!(!backend.exists(&tmp_path("/b/f")));
        assert!(!backend.exists("/b/f"));
    }

    #[test]
    fn test_copy_retries_transient_failure() {
        let backend = MemoryBackend::new();
        backend.add_file("/a/f", 10);
        backend.mkdir_all("/b");
        backend.inject_fault("rename", None, BackendErrorKind::Other, 1);

        let command = Command::Copy(FileCopy::new("/a/f", "/b/f", 10));
        let status = execute(&backend, &options(), &command);
        assert_eq!(status, TaskStatus::Ok);
        assert!(backend.exists("/b/f"));
    }

    #[test]
    fn test_quota_not_retried() {
        let backend = MemoryBackend::new();
        backend.add_file("/a/f", 10);
        backend.mkdir_all("/b");
        backend.inject_fault("create", None, BackendErrorKind::QuotaExceeded, 1);

        let command = Command::Copy(FileCopy::new("/a/f", "/b/f", 10));
        let status = execute(&backend, &options(), &command);
        assert_eq!(status, TaskStatus::Failed);
        assert!(!backend.exists("/b/f"));
    }

    #[test]
    fn test_migrate_busy_source() {
        let backend = MemoryBackend::new();
        backend.add_host("h1", 1000);
        backend.add_host("h2", 1000);
        backend.add_replicated_file("/f", 10, &["h1"]);
        backend.set_busy("/f", "h1", true);

        let command = Command::Migrate(ReplicaTransfer {
            path: "/f".into(),
            size: 10,
            src_host: Some("h1".into()),
            dst_host: "h2".into(),
            check_disk_avail: false,
        });
        assert_eq!(
            execute(&backend, &options(), &command),
            TaskStatus::BusyRemoveSourceReplica
        );
        assert_eq!(backend.replicas("/f"), vec!["h1", "h2"]);
    }

    #[test]
    fn test_check_disk_avail_refuses_full_host() {
        let backend = MemoryBackend::new();
        backend.add_host("h1", 1000);
        backend.add_host("h2", 50);
        backend.add_replicated_file("/f", 40, &["h1"]);

        let mut opts = options();
        opts.minimum_free = 20;
        let command = Command::Replicate(ReplicaTransfer {
            path: "/f".into(),
            size: 40,
            src_host: None,
            dst_host: "h2".into(),
            check_disk_avail: true,
        });
        assert_eq!(execute(&backend, &opts, &command), TaskStatus::Failed);
        assert_eq!(backend.replicas("/f"), vec!["h1"]);
    }

    #[test]
    fn test_simulate_touches_nothing() {
        let backend = MemoryBackend::new();
        let mut opts = options();
        opts.simulate_rate = 1000;
        let command = Command::Copy(FileCopy::new("/missing", "/nowhere", 1000));
        assert_eq!(execute(&backend, &opts, &command), TaskStatus::Ok);
        assert!(!backend.exists("/nowhere"));
    }
}
