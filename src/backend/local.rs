//! Local filesystem backend
//!
//! Plain POSIX files: listings come from `read_dir` plus `lstat`, copies use
//! ordinary files, and times (of files and of symlinks themselves) are set
//! with `filetime`. There are no replicas,
//! so the replica operations report Unsupported and replica lists are empty.

use super::types::{DirEntry, FileStat, Timespec};
use super::{Connector, FileSink, MetadataClient, Session, StorageBackend};
use crate::error::{BackendError, BackendErrorKind, BackendResult};
use filetime::FileTime;
use std::fs::{self, DirBuilder, File, Metadata, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{symlink, DirBuilderExt, MetadataExt, OpenOptionsExt};
use tracing::debug;

/// Connector for the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for LocalBackend {
    fn connect(&self) -> BackendResult<Box<dyn Session>> {
        Ok(Box::new(LocalSession))
    }
}

/// Session on the local filesystem (stateless)
#[derive(Debug, Default)]
pub struct LocalSession;

fn stat_from(meta: &Metadata) -> FileStat {
    FileStat {
        mode: meta.mode(),
        nlink: meta.nlink(),
        size: meta.size(),
        atime: Timespec::new(meta.atime(), meta.atime_nsec() as u32),
        mtime: Timespec::new(meta.mtime(), meta.mtime_nsec() as u32),
    }
}

fn unsupported(op: &'static str, path: &str) -> BackendError {
    BackendError::new(BackendErrorKind::Unsupported, op, path)
        .with_message("local files have no replicas")
}

impl MetadataClient for LocalSession {
    fn list_directory(&mut self, path: &str) -> BackendResult<Vec<DirEntry>> {
        let dir = fs::read_dir(path).map_err(|e| BackendError::from_io("opendir", path, &e))?;
        let mut entries = Vec::new();
        for item in dir {
            let item = item.map_err(|e| BackendError::from_io("readdir", path, &e))?;
            let name = item.file_name().to_string_lossy().into_owned();
            match fs::symlink_metadata(item.path()) {
                Ok(meta) => entries.push(DirEntry {
                    name,
                    stat: stat_from(&meta),
                }),
                // removed between readdir and lstat
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(path, name = %name, "Entry vanished during listing");
                }
                Err(e) => return Err(BackendError::from_io("lstat", path, &e)),
            }
        }
        Ok(entries)
    }

    fn stat_path(&mut self, path: &str) -> BackendResult<FileStat> {
        fs::symlink_metadata(path)
            .map(|m| stat_from(&m))
            .map_err(|e| BackendError::from_io("lstat", path, &e))
    }

    fn replica_hosts(&mut self, _path: &str) -> BackendResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn schedule_hosts(&mut self, _domain: Option<&str>) -> BackendResult<Vec<String>> {
        Ok(Vec::new())
    }
}

struct LocalSink(File);

impl Write for LocalSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl FileSink for LocalSink {
    fn sync(&mut self) -> io::Result<()> {
        self.0.sync_all()
    }
}

impl StorageBackend for LocalSession {
    fn replicate(
        &mut self,
        path: &str,
        _src_host: Option<&str>,
        _dst_host: &str,
    ) -> BackendResult<()> {
        Err(unsupported("replicate", path))
    }

    fn remove_replica(&mut self, path: &str, _host: &str) -> BackendResult<()> {
        Err(unsupported("remove_replica", path))
    }

    fn disk_avail(&mut self, host: &str) -> BackendResult<u64> {
        Err(unsupported("disk_avail", "").with_host(host))
    }

    fn open_read(&mut self, path: &str, _host: Option<&str>) -> BackendResult<Box<dyn Read>> {
        let file = File::open(path).map_err(|e| BackendError::from_io("open", path, &e))?;
        Ok(Box::new(file))
    }

    fn create(
        &mut self,
        path: &str,
        mode: u32,
        exclusive: bool,
        _host: Option<&str>,
    ) -> BackendResult<Box<dyn FileSink>> {
        let mut opts = OpenOptions::new();
        opts.write(true).mode(mode & 0o7777);
        if exclusive {
            opts.create_new(true);
        } else {
            opts.create(true).truncate(true);
        }
        let file = opts
            .open(path)
            .map_err(|e| BackendError::from_io("create", path, &e))?;
        Ok(Box::new(LocalSink(file)))
    }

    fn set_times(&mut self, path: &str, atime: Timespec, mtime: Timespec) -> BackendResult<()> {
        filetime::set_file_times(
            path,
            FileTime::from_unix_time(atime.sec, atime.nsec),
            FileTime::from_unix_time(mtime.sec, mtime.nsec),
        )
        .map_err(|e| BackendError::from_io("set_times", path, &e))
    }

    fn rename(&mut self, from: &str, to: &str) -> BackendResult<()> {
        fs::rename(from, to).map_err(|e| BackendError::from_io("rename", from, &e))
    }

    fn unlink(&mut self, path: &str) -> BackendResult<()> {
        fs::remove_file(path).map_err(|e| BackendError::from_io("unlink", path, &e))
    }

    fn mkdir(&mut self, path: &str, mode: u32) -> BackendResult<()> {
        DirBuilder::new()
            .mode(mode & 0o7777)
            .create(path)
            .map_err(|e| BackendError::from_io("mkdir", path, &e))
    }

    fn rmdir(&mut self, path: &str) -> BackendResult<()> {
        fs::remove_dir(path).map_err(|e| BackendError::from_io("rmdir", path, &e))
    }

    fn read_link(&mut self, path: &str) -> BackendResult<String> {
        fs::read_link(path)
            .map(|target| target.to_string_lossy().into_owned())
            .map_err(|e| BackendError::from_io("readlink", path, &e))
    }

    fn symlink(&mut self, target: &str, path: &str) -> BackendResult<()> {
        symlink(target, path).map_err(|e| BackendError::from_io("symlink", path, &e))
    }

    fn set_link_times(
        &mut self,
        path: &str,
        atime: Timespec,
        mtime: Timespec,
    ) -> BackendResult<()> {
        filetime::set_symlink_file_times(
            path,
            FileTime::from_unix_time(atime.sec, atime.nsec),
            FileTime::from_unix_time(mtime.sec, mtime.nsec),
        )
        .map_err(|e| BackendError::from_io("lutimes", path, &e))
    }
}
