//! File metadata types shared by backends, the walker and the dispatcher

use std::fmt;

/// Type of filesystem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryType {
    /// Regular file
    File = 0,
    /// Directory
    Directory = 1,
    /// Symbolic link
    Symlink = 2,
    /// Block device
    BlockDevice = 3,
    /// Character device
    CharDevice = 4,
    /// Named pipe (FIFO)
    Fifo = 5,
    /// Unix socket
    Socket = 6,
    /// Unknown type
    Unknown = 255,
}

impl EntryType {
    /// Convert from the integer carried on worker streams
    pub fn from_wire(value: i32) -> Self {
        match value {
            0 => EntryType::File,
            1 => EntryType::Directory,
            2 => EntryType::Symlink,
            3 => EntryType::BlockDevice,
            4 => EntryType::CharDevice,
            5 => EntryType::Fifo,
            6 => EntryType::Socket,
            _ => EntryType::Unknown,
        }
    }

    /// Integer representation for worker streams
    pub fn to_wire(self) -> i32 {
        self as i32
    }

    /// Convert from Unix mode bits
    pub fn from_mode(mode: u32) -> Self {
        match mode & 0o170000 {
            0o100000 => EntryType::File,        // S_IFREG
            0o040000 => EntryType::Directory,   // S_IFDIR
            0o120000 => EntryType::Symlink,     // S_IFLNK
            0o060000 => EntryType::BlockDevice, // S_IFBLK
            0o020000 => EntryType::CharDevice,  // S_IFCHR
            0o010000 => EntryType::Fifo,        // S_IFIFO
            0o140000 => EntryType::Socket,      // S_IFSOCK
            _ => EntryType::Unknown,
        }
    }

    /// Type bits for building a mode
    pub fn mode_bits(self) -> u32 {
        match self {
            EntryType::File => 0o100000,
            EntryType::Directory => 0o040000,
            EntryType::Symlink => 0o120000,
            EntryType::BlockDevice => 0o060000,
            EntryType::CharDevice => 0o020000,
            EntryType::Fifo => 0o010000,
            EntryType::Socket => 0o140000,
            EntryType::Unknown => 0,
        }
    }

    pub fn is_file(&self) -> bool {
        *self == EntryType::File
    }

    pub fn is_dir(&self) -> bool {
        *self == EntryType::Directory
    }

    pub fn is_symlink(&self) -> bool {
        *self == EntryType::Symlink
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryType::File => "file",
            EntryType::Directory => "dir",
            EntryType::Symlink => "symlink",
            EntryType::BlockDevice => "blockdev",
            EntryType::CharDevice => "chardev",
            EntryType::Fifo => "fifo",
            EntryType::Socket => "socket",
            EntryType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Seconds and nanoseconds since the Unix epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

impl Timespec {
    pub const fn new(sec: i64, nsec: u32) -> Self {
        Self { sec, nsec }
    }
}

/// lstat-style metadata for one path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileStat {
    /// File mode (type + permissions)
    pub mode: u32,

    /// Number of hard links
    pub nlink: u64,

    /// File size in bytes
    pub size: u64,

    /// Last access time
    pub atime: Timespec,

    /// Last modification time
    pub mtime: Timespec,
}

impl FileStat {
    pub fn entry_type(&self) -> EntryType {
        EntryType::from_mode(self.mode)
    }

    pub fn is_file(&self) -> bool {
        self.entry_type().is_file()
    }

    pub fn is_dir(&self) -> bool {
        self.entry_type().is_dir()
    }

    /// Permission bits without the type
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// One name returned by a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub stat: FileStat,
}

impl DirEntry {
    /// `.` and `..`
    pub fn is_dot(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// Join a root path and a relative subpath
///
/// An empty subpath names the root itself; a root of `/` does not double
/// the separator.
pub fn join_path(root: &str, subpath: &str) -> String {
    if subpath.is_empty() {
        root.to_string()
    } else if root.ends_with('/') {
        format!("{}{}", root, subpath)
    } else {
        format!("{}/{}", root, subpath)
    }
}

/// Strip trailing separators, keeping a bare `/`
pub fn trim_root(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_type_from_mode() {
        assert_eq!(EntryType::from_mode(0o100644), EntryType::File);
        assert_eq!(EntryType::from_mode(0o040755), EntryType::Directory);
        assert_eq!(EntryType::from_mode(0o120777), EntryType::Symlink);
        assert_eq!(EntryType::from_mode(0o000644), EntryType::Unknown);
    }

    #[test]
    fn test_entry_type_wire_and_mode_agree() {
        for t in [
            EntryType::File,
            EntryType::Directory,
            EntryType::Symlink,
            EntryType::Fifo,
            EntryType::Unknown,
        ] {
            assert_eq!(EntryType::from_wire(t.to_wire()), t);
            if t != EntryType::Unknown {
                assert_eq!(EntryType::from_mode(t.mode_bits() | 0o644), t);
            }
        }
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/a", ""), "/a");
        assert_eq!(join_path("/a", "b/c"), "/a/b/c");
        assert_eq!(join_path("/", "b"), "/b");
        assert_eq!(join_path("rel", "x"), "rel/x");
    }

    #[test]
    fn test_trim_root() {
        assert_eq!(trim_root("/data/"), "/data");
        assert_eq!(trim_root("///"), "/");
        assert_eq!(trim_root("/"), "/");
        assert_eq!(trim_root("dir//"), "dir");
    }
}
