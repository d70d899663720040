//! Worker routine for the tree walk
//!
//! Each worker:
//! - Opens its own backend session (never shared with other workers)
//! - Lists directories and streams names plus lstat results back
//! - Resolves replica lists and destination metadata for single entries
//!
//! Every backend call goes through [`WorkerSession::call`], so a connection
//! error is retried once after reconnecting and a second one surfaces.

use super::entry::child_subpath;
use super::protocol::*;
use crate::backend::{join_path, Connector, FileStat, WorkerSession};
use crate::error::{BackendErrorKind, WireError, WireResult};
use crate::pool::{Frame, WorkerEndpoint, WorkerLog};
use std::sync::Arc;

/// What every walker worker needs to know
pub(crate) struct WalkContext {
    pub connector: Arc<dyn Connector>,
    pub src_root: String,
    pub dst_root: Option<String>,
}

/// Worker main loop: serve requests until TERMINATE or the stream closes
pub(crate) fn run(ctx: &WalkContext, mut ep: WorkerEndpoint) -> WireResult<()> {
    let mut session = match WorkerSession::open(Arc::clone(&ctx.connector)) {
        Ok(s) => s,
        Err(e) => {
            // closing the streams tells the coordinator
            ep.log.error(format_args!("connect failed: {}", e));
            return Ok(());
        }
    };

    loop {
        let op = match ep.requests.get_i32() {
            Ok(op) => op,
            Err(WireError::UnexpectedEof) => return Ok(()),
            Err(e) => return Err(e),
        };

        let reply = match op {
            OP_LIST_DIR => {
                let subpath = ep.requests.get_string()?;
                list_dir(ctx, &mut session, &mut ep.log, &subpath)
            }
            OP_FILE_INFO => {
                let subpath = ep.requests.get_string()?;
                let is_file = ep.requests.get_bool()?;
                file_info(ctx, &mut session, &mut ep.log, &subpath, is_file)
            }
            OP_TERMINATE => {
                let mut reply = Frame::new();
                reply.put_i32(ST_END);
                ep.reply(&reply)?;
                return Ok(());
            }
            tag => {
                return Err(WireError::UnexpectedTag {
                    what: "walker request",
                    tag,
                })
            }
        };
        ep.reply(&reply)?;
    }
}

fn put_record(frame: &mut Frame, subpath: &str, stat: &FileStat) {
    frame
        .put_i32(TAG_NAME)
        .put_str(subpath)
        .put_i64(stat.mtime.sec)
        .put_i32(stat.mtime.nsec as i32)
        .put_i32(stat.mode as i32)
        .put_i64(stat.nlink as i64)
        .put_i32(stat.entry_type().to_wire())
        .put_i64(stat.size as i64);
}

fn list_dir(
    ctx: &WalkContext,
    session: &mut WorkerSession,
    log: &mut WorkerLog,
    subpath: &str,
) -> Frame {
    let path = join_path(&ctx.src_root, subpath);
    let mut reply = Frame::new();

    // the root may be a single file: report it alone
    if subpath.is_empty() {
        match session.call(log, |s| s.stat_path(&path)) {
            Ok(stat) if !stat.is_dir() => {
                reply.put_i32(ST_DENTS_OK);
                put_record(&mut reply, "", &stat);
                reply.put_i32(TAG_ENTRY_END);
                return reply;
            }
            Ok(_) => {}
            Err(e) => {
                log.error(&e);
                reply.put_i32(ST_NG).put_str(&e.to_string());
                return reply;
            }
        }
    }

    match session.call(log, |s| s.list_directory(&path)) {
        Ok(entries) => {
            reply.put_i32(ST_DENTS_OK);
            for entry in entries.iter().filter(|e| !e.is_dot()) {
                put_record(&mut reply, &child_subpath(subpath, &entry.name), &entry.stat);
            }
            reply.put_i32(TAG_ENTRY_END);
            log.debug(format_args!("listed {} ({} names)", path, entries.len()));
        }
        Err(e) => {
            log.warn(format_args!("{}: skipped", e));
            reply.put_i32(ST_IGNORE).put_str(&e.to_string());
        }
    }
    reply
}

fn file_info(
    ctx: &WalkContext,
    session: &mut WorkerSession,
    log: &mut WorkerLog,
    subpath: &str,
    is_file: bool,
) -> Frame {
    let mut reply = Frame::new();

    let src_replicas = if is_file {
        let path = join_path(&ctx.src_root, subpath);
        session.call(log, |s| s.replica_hosts(&path)).unwrap_or_else(|e| {
            log.warn(&e);
            Vec::new()
        })
    } else {
        Vec::new()
    };

    let dst = match &ctx.dst_root {
        Some(root) => {
            let path = join_path(root, subpath);
            match session.call(log, |s| s.stat_path(&path)) {
                Ok(stat) => {
                    let replicas = if stat.is_file() {
                        session.call(log, |s| s.replica_hosts(&path)).unwrap_or_else(|e| {
                            log.warn(&e);
                            Vec::new()
                        })
                    } else {
                        Vec::new()
                    };
                    Some((stat, replicas))
                }
                Err(e) if e.kind == BackendErrorKind::NotFound => None,
                Err(e) => {
                    log.error(&e);
                    reply.put_i32(ST_NG).put_str(&e.to_string());
                    return reply;
                }
            }
        }
        None => None,
    };

    reply.put_i32(ST_FINFO_OK).put_strs(&src_replicas);
    match dst {
        Some((stat, replicas)) => {
            reply
                .put_bool(true)
                .put_i64(stat.mtime.sec)
                .put_i32(stat.mtime.nsec as i32)
                .put_i32(stat.entry_type().to_wire())
                .put_i64(stat.size as i64)
                .put_strs(&replicas);
        }
        None => {
            reply.put_bool(false);
        }
    }
    reply
}
