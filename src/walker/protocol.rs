//! Walker request/response codes
//!
//! Requests:
//!
//! ```text
//!   LIST_DIR   subpath:str
//!   FILE_INFO  subpath:str is_file:bool
//!   TERMINATE
//! ```
//!
//! Responses start with a status:
//!
//! ```text
//!   DENTS_OK   { NAME record }* ENTRY_END
//!   FINFO_OK   src_replicas:[str] dst_exists:bool [dst record]
//!   IGNORE     message:str          directory could not be read
//!   NG         message:str          entry could not be resolved
//!   END                             worker exits
//! ```
//!
//! A NAME record is `subpath:str mtime_sec:i64 mtime_nsec:i32 mode:i32
//! nlink:i64 type:i32 size:i64`; a dst record is `mtime_sec:i64
//! mtime_nsec:i32 type:i32 size:i64 replicas:[str]`.

pub const OP_LIST_DIR: i32 = 0;
pub const OP_FILE_INFO: i32 = 1;
pub const OP_TERMINATE: i32 = 2;

pub const ST_DENTS_OK: i32 = 0;
pub const ST_FINFO_OK: i32 = 1;
pub const ST_IGNORE: i32 = 2;
pub const ST_NG: i32 = 3;
pub const ST_END: i32 = 4;

pub const TAG_NAME: i32 = 0;
pub const TAG_ENTRY_END: i32 = 1;
