//! Task commands and outcomes, and their worker-stream encoding
//!
//! A command frame is the opcode followed by the operation's fields:
//!
//! ```text
//!   REPLICATE / MIGRATE  path size src_host? dst_host check_disk_avail
//!   COPY / MOVE          src dst size src_host? dst_host? check_disk_avail skip_existing
//!   REMOVE_REPLICA       path host
//!   TERMINATE
//! ```
//!
//! `x?` is a bool presence flag followed by the string when set. The worker
//! answers every command with a single status code.

use crate::error::{WireError, WireResult};
use crate::pool::{Frame, FrameReader};
use std::fmt;
use std::io::Read;

pub(crate) const OP_REPLICATE: i32 = 0;
pub(crate) const OP_MIGRATE: i32 = 1;
pub(crate) const OP_COPY: i32 = 2;
pub(crate) const OP_MOVE: i32 = 3;
pub(crate) const OP_REMOVE_REPLICA: i32 = 4;
pub(crate) const OP_TERMINATE: i32 = 5;

/// Kind of file-movement task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Replicate,
    /// Replicate, then remove the source replica
    Migrate,
    Copy,
    /// Copy, then unlink the source
    Move,
    RemoveReplica,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Replicate => "replicate",
            Operation::Migrate => "migrate",
            Operation::Copy => "copy",
            Operation::Move => "move",
            Operation::RemoveReplica => "remove-replica",
        };
        f.write_str(s)
    }
}

/// Replicate a file from one host to another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaTransfer {
    pub path: String,
    pub size: u64,
    /// Host to read from; any replica when unset
    pub src_host: Option<String>,
    pub dst_host: String,
    /// Fail early when the destination lacks space for `size`
    pub check_disk_avail: bool,
}

/// Copy a file to a new path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCopy {
    pub src: String,
    pub dst: String,
    pub size: u64,
    /// Replica to read from
    pub src_host: Option<String>,
    /// Host to place the new file on
    pub dst_host: Option<String>,
    pub check_disk_avail: bool,
    /// Skip when the destination already has the same size and mtime
    pub skip_existing: bool,
}

impl FileCopy {
    pub fn new(src: impl Into<String>, dst: impl Into<String>, size: u64) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            size,
            src_host: None,
            dst_host: None,
            check_disk_avail: false,
            skip_existing: false,
        }
    }

    pub fn skip_existing(mut self, skip: bool) -> Self {
        self.skip_existing = skip;
        self
    }
}

/// One unit of work for the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Replicate(ReplicaTransfer),
    Migrate(ReplicaTransfer),
    Copy(FileCopy),
    Move(FileCopy),
    RemoveReplica { path: String, host: String },
}

impl Command {
    pub fn operation(&self) -> Operation {
        match self {
            Command::Replicate(_) => Operation::Replicate,
            Command::Migrate(_) => Operation::Migrate,
            Command::Copy(_) => Operation::Copy,
            Command::Move(_) => Operation::Move,
            Command::RemoveReplica { .. } => Operation::RemoveReplica,
        }
    }

    /// Path the command acts on (the source for copies)
    pub fn path(&self) -> &str {
        match self {
            Command::Replicate(t) | Command::Migrate(t) => &t.path,
            Command::Copy(c) | Command::Move(c) => &c.src,
            Command::RemoveReplica { path, .. } => path,
        }
    }

    /// Bytes the command moves
    pub fn size(&self) -> u64 {
        match self {
            Command::Replicate(t) | Command::Migrate(t) => t.size,
            Command::Copy(c) | Command::Move(c) => c.size,
            Command::RemoveReplica { .. } => 0,
        }
    }

    fn opcode(&self) -> i32 {
        match self {
            Command::Replicate(_) => OP_REPLICATE,
            Command::Migrate(_) => OP_MIGRATE,
            Command::Copy(_) => OP_COPY,
            Command::Move(_) => OP_MOVE,
            Command::RemoveReplica { .. } => OP_REMOVE_REPLICA,
        }
    }

    pub(crate) fn encode(&self, frame: &mut Frame) {
        frame.put_i32(self.opcode());
        match self {
            Command::Replicate(t) | Command::Migrate(t) => {
                frame.put_str(&t.path).put_i64(t.size as i64);
                put_opt(frame, t.src_host.as_deref());
                frame.put_str(&t.dst_host).put_bool(t.check_disk_avail);
            }
            Command::Copy(c) | Command::Move(c) => {
                frame.put_str(&c.src).put_str(&c.dst).put_i64(c.size as i64);
                put_opt(frame, c.src_host.as_deref());
                put_opt(frame, c.dst_host.as_deref());
                frame.put_bool(c.check_disk_avail).put_bool(c.skip_existing);
            }
            Command::RemoveReplica { path, host } => {
                frame.put_str(path).put_str(host);
            }
        }
    }

    /// Read the fields of a command whose opcode was already read
    pub(crate) fn decode<R: Read>(opcode: i32, r: &mut FrameReader<R>) -> WireResult<Self> {
        let command = match opcode {
            OP_REPLICATE | OP_MIGRATE => {
                let transfer = ReplicaTransfer {
                    path: r.get_string()?,
                    size: r.get_i64()?.max(0) as u64,
                    src_host: get_opt(r)?,
                    dst_host: r.get_string()?,
                    check_disk_avail: r.get_bool()?,
                };
                if opcode == OP_REPLICATE {
                    Command::Replicate(transfer)
                } else {
                    Command::Migrate(transfer)
                }
            }
            OP_COPY | OP_MOVE => {
                let copy = FileCopy {
                    src: r.get_string()?,
                    dst: r.get_string()?,
                    size: r.get_i64()?.max(0) as u64,
                    src_host: get_opt(r)?,
                    dst_host: get_opt(r)?,
                    check_disk_avail: r.get_bool()?,
                    skip_existing: r.get_bool()?,
                };
                if opcode == OP_COPY {
                    Command::Copy(copy)
                } else {
                    Command::Move(copy)
                }
            }
            OP_REMOVE_REPLICA => Command::RemoveReplica {
                path: r.get_string()?,
                host: r.get_string()?,
            },
            tag => {
                return Err(WireError::UnexpectedTag {
                    what: "dispatch request",
                    tag,
                })
            }
        };
        Ok(command)
    }
}

fn put_opt(frame: &mut Frame, value: Option<&str>) {
    match value {
        Some(s) => {
            frame.put_bool(true).put_str(s);
        }
        None => {
            frame.put_bool(false);
        }
    }
}

fn get_opt<R: Read>(r: &mut FrameReader<R>) -> WireResult<Option<String>> {
    if r.get_bool()? {
        Ok(Some(r.get_string()?))
    } else {
        Ok(None)
    }
}

/// Outcome of one task, reported to the completion callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Ok,
    Failed,
    /// Destination already up to date
    Skipped,
    /// Migrated, but the source replica was busy and is still there
    BusyRemoveSourceReplica,
    /// The worker's stream broke while the task was outstanding
    Fatal,
    /// Worker acknowledged termination
    End,
}

impl TaskStatus {
    pub(crate) fn to_wire(self) -> i32 {
        match self {
            TaskStatus::Ok => 0,
            TaskStatus::Failed => 1,
            TaskStatus::Skipped => 2,
            TaskStatus::BusyRemoveSourceReplica => 3,
            TaskStatus::Fatal => 4,
            TaskStatus::End => 5,
        }
    }

    pub(crate) fn from_wire(value: i32) -> Option<Self> {
        let status = match value {
            0 => TaskStatus::Ok,
            1 => TaskStatus::Failed,
            2 => TaskStatus::Skipped,
            3 => TaskStatus::BusyRemoveSourceReplica,
            4 => TaskStatus::Fatal,
            5 => TaskStatus::End,
            _ => return None,
        };
        Some(status)
    }

    /// Ok or Skipped
    pub fn is_success(self) -> bool {
        matches!(self, TaskStatus::Ok | TaskStatus::Skipped)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Ok => "ok",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::BusyRemoveSourceReplica => "busy (source replica kept)",
            TaskStatus::Fatal => "fatal",
            TaskStatus::End => "end",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn decode(command: &Command) -> Command {
        let mut frame = Frame::new();
        command.encode(&mut frame);
        let mut r = FrameReader::new(Cursor::new(frame.as_bytes().to_vec()));
        let opcode = r.get_i32().unwrap();
        Command::decode(opcode, &mut r).unwrap()
    }

    #[test]
    fn test_copy_fields_survive_encoding() {
        let mut copy = FileCopy::new("/a/f1", "/b/f1", 10 << 20).skip_existing(true);
        copy.dst_host = Some("node2".into());
        let command = Command::Move(copy);
        assert_eq!(decode(&command), command);
        assert_eq!(command.operation(), Operation::Move);
        assert_eq!(command.path(), "/a/f1");
    }

    #[test]
    fn test_migrate_without_source_host() {
        let command = Command::Migrate(ReplicaTransfer {
            path: "/f".into(),
            size: 1,
            src_host: None,
            dst_host: "h2".into(),
            check_disk_avail: true,
        });
        assert_eq!(decode(&command), command);
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let mut r = FrameReader::new(Cursor::new(Vec::new()));
        assert!(matches!(
            Command::decode(42, &mut r),
            Err(WireError::UnexpectedTag { tag: 42, .. })
        ));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(TaskStatus::from_wire(TaskStatus::Skipped.to_wire()), Some(TaskStatus::Skipped));
        assert_eq!(TaskStatus::from_wire(99), None);
        assert!(TaskStatus::Skipped.is_success());
        assert!(!TaskStatus::BusyRemoveSourceReplica.is_success());
    }
}
