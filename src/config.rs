//! Configuration types for bulkmove
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Runtime configuration with validation
//! - Location parsing

use crate::dispatch::{DispatchOptions, DEFAULT_BUFFER_SIZE};
use crate::error::ConfigError;
use crate::replicate::{ReplicateOptions, DEFAULT_MAX_RW};
use clap::{Args, Parser, Subcommand};
use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

/// Maximum reasonable worker count
const MAX_WORKERS: usize = 512;

/// Minimum queue size
const MIN_QUEUE_SIZE: usize = 1;

/// Copy buffer limits
const MIN_BUFFER_SIZE: usize = 512;
const MAX_BUFFER_SIZE: usize = 64 * 1024 * 1024;

/// Regex for parsing locations
static LOCATION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    // Matches: scheme://path or a plain path
    Regex::new(r"^(?:([A-Za-z][A-Za-z0-9+.-]*)://)?(\S.*)$").expect("Invalid location regex")
});

/// Parallel file tree walker and copier
#[derive(Parser, Debug, Clone)]
#[command(
    name = "bulkmove",
    version,
    about = "Parallel file tree walker, copier and replicator",
    long_about = "Walks a source tree with a pool of workers and, for 'copy', feeds every\n\
                  regular file to a second pool that copies it through a temporary name.\n\
                  'replicate' places, migrates or trims replicas across storage hosts.",
    after_help = "EXAMPLES:\n    \
        bulkmove list /data -r\n    \
        bulkmove list file:///data -r --exclude '\\.snapshot'\n    \
        bulkmove copy /data /backup/data -j 16 --skip-existing\n    \
        bulkmove copy /data /backup/data --simulate 100000\n    \
        bulkmove replicate /data -N 3 -x\n    \
        bulkmove replicate /data -m -S .old.example.com -D .new.example.com"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: CliCommand,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum CliCommand {
    /// Walk a tree and print one line per entry
    List(ListArgs),

    /// Copy a tree to a new location
    Copy(CopyArgs),

    /// Add, migrate or remove replicas of every file in a tree
    Replicate(ReplicateArgs),
}

/// Options shared by every walk
#[derive(Args, Debug, Clone)]
pub struct WalkArgs {
    /// Source path (plain path or file://path)
    #[arg(value_name = "SRC")]
    pub src: String,

    /// Number of walker workers
    #[arg(short = 'j', long, default_value_t = default_workers(), value_name = "NUM")]
    pub workers: usize,

    /// Walker result queue size
    #[arg(long, default_value = "1024", value_name = "NUM")]
    pub queue_size: usize,

    /// Exclude paths matching pattern (can be repeated)
    #[arg(long = "exclude", value_name = "PATTERN", action = clap::ArgAction::Append)]
    pub exclude_patterns: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    #[command(flatten)]
    pub walk: WalkArgs,

    /// Descend into subdirectories
    #[arg(short = 'r', long)]
    pub recursive: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CopyArgs {
    #[command(flatten)]
    pub walk: WalkArgs,

    /// Destination path (plain path or file://path)
    #[arg(value_name = "DST")]
    pub dst: String,

    /// Number of copy workers (defaults to the walker's)
    #[arg(long, value_name = "NUM")]
    pub copy_workers: Option<usize>,

    /// Skip files whose destination has the same size and mtime
    #[arg(long)]
    pub skip_existing: bool,

    /// Overwrite newer destinations; keep only those with the same size and mtime
    #[arg(short = 'f', long)]
    pub force: bool,

    /// Do not copy; sleep as if moving data at this many KB/s
    #[arg(long, value_name = "KBPS")]
    pub simulate: Option<u64>,

    /// Copy buffer size in bytes
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE, value_name = "BYTES")]
    pub buffer_size: usize,

    /// Retries for a failed copy
    #[arg(long, default_value = "2", value_name = "NUM")]
    pub retries: u32,

    /// Seconds between retries
    #[arg(long, default_value = "1", value_name = "SECS")]
    pub retry_delay: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ReplicateArgs {
    #[command(flatten)]
    pub walk: WalkArgs,

    /// Desired number of replicas per file
    #[arg(short = 'N', long, default_value = "1", value_name = "NUM")]
    pub copies: usize,

    /// Move replicas off the source hosts instead of adding replicas
    #[arg(short = 'm', long)]
    pub migrate: bool,

    /// Remove replicas beyond the desired number
    #[arg(short = 'x', long)]
    pub remove_excess: bool,

    /// Read only from hosts in this domain
    #[arg(short = 'S', long, value_name = "DOMAIN")]
    pub src_domain: Option<String>,

    /// Place replicas only on hosts in this domain
    #[arg(short = 'D', long, value_name = "DOMAIN")]
    pub dst_domain: Option<String>,

    /// Concurrent transfers per host
    #[arg(long, default_value_t = DEFAULT_MAX_RW, value_name = "NUM")]
    pub max_rw: usize,

    /// Skip files smaller than this
    #[arg(short = 'z', long, value_name = "BYTES")]
    pub min_size: Option<u64>,

    /// Skip files larger than this
    #[arg(short = 'Z', long, value_name = "BYTES")]
    pub max_size: Option<u64>,

    /// Stop once this many bytes have been scheduled
    #[arg(short = 'M', long, value_name = "BYTES")]
    pub max_total: Option<u64>,

    /// Bytes every destination host keeps free
    #[arg(long, default_value = "0", value_name = "BYTES")]
    pub minimum_free: u64,

    /// Number of transfer workers (defaults to the walker's)
    #[arg(long, value_name = "NUM")]
    pub copy_workers: Option<usize>,

    /// Do not transfer; sleep as if moving data at this many KB/s
    #[arg(long, value_name = "KBPS")]
    pub simulate: Option<u64>,

    /// Retries for a failed replication
    #[arg(long, default_value = "2", value_name = "NUM")]
    pub retries: u32,

    /// Seconds between retries
    #[arg(long, default_value = "1", value_name = "SECS")]
    pub retry_delay: u64,
}

fn default_workers() -> usize {
    num_cpus::get()
}

/// Where a tree lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// URL scheme; `file` for plain paths
    pub scheme: String,

    /// Path within the backend, without trailing slashes
    pub path: String,
}

impl Location {
    /// Parse a location string
    ///
    /// Accepts formats:
    /// - /plain/path
    /// - relative/path
    /// - file:///absolute/path
    pub fn parse(location: &str) -> Result<Self, ConfigError> {
        let location = location.trim();
        let invalid = |reason: &str| ConfigError::InvalidLocation {
            location: location.to_string(),
            reason: reason.to_string(),
        };

        let caps = LOCATION_REGEX
            .captures(location)
            .ok_or_else(|| invalid("empty path"))?;
        let scheme = caps.get(1).map_or("file", |m| m.as_str()).to_ascii_lowercase();
        if scheme != "file" {
            return Err(invalid("only file:// locations are supported"));
        }

        let raw = caps.get(2).map_or("", |m| m.as_str());
        let path = if raw.len() > 1 {
            raw.trim_end_matches('/')
        } else {
            raw
        };
        if path.is_empty() {
            return Ok(Self {
                scheme,
                path: "/".to_string(),
            });
        }
        Ok(Self {
            scheme,
            path: path.to_string(),
        })
    }

    /// Absolute form of the path, for overlap checks
    pub fn absolute(&self) -> PathBuf {
        std::path::absolute(&self.path).unwrap_or_else(|_| PathBuf::from(&self.path))
    }

    /// Whether `self` is `other` or lies below it
    pub fn is_within(&self, other: &Location) -> bool {
        self.scheme == other.scheme && self.absolute().starts_with(other.absolute())
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.path)
    }
}

/// Validated configuration for a walk
#[derive(Debug, Clone)]
pub struct WalkConfig {
    /// Parsed source location
    pub src: Location,

    /// Descend into subdirectories
    pub recursive: bool,

    /// Number of walker workers
    pub worker_count: usize,

    /// Result queue capacity
    pub queue_size: usize,

    /// Compiled exclude patterns
    pub exclude_patterns: Vec<Regex>,

    /// Show progress indicator
    pub show_progress: bool,

    /// Verbose logging
    pub verbose: bool,
}

impl WalkConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_args(
        args: &WalkArgs,
        recursive: bool,
        quiet: bool,
        verbose: bool,
    ) -> Result<Self, ConfigError> {
        let src = Location::parse(&args.src)?;
        validate_workers(args.workers)?;

        if args.queue_size < MIN_QUEUE_SIZE {
            return Err(ConfigError::InvalidQueueSize {
                size: args.queue_size,
                min: MIN_QUEUE_SIZE,
            });
        }

        let exclude_patterns = args
            .exclude_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| ConfigError::InvalidExcludePattern {
                    pattern: p.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            src,
            recursive,
            worker_count: args.workers,
            queue_size: args.queue_size,
            exclude_patterns,
            show_progress: !quiet,
            verbose,
        })
    }

    /// Check if a subpath should be excluded
    pub fn is_excluded(&self, subpath: &str) -> bool {
        self.exclude_patterns.iter().any(|re| re.is_match(subpath))
    }
}

/// Validated configuration for a copy
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// The source walk
    pub walk: WalkConfig,

    /// Parsed destination location
    pub dst: Location,

    /// Number of copy workers
    pub worker_count: usize,

    /// Skip up-to-date destinations
    pub skip_existing: bool,

    /// Keep only destinations with the same size and mtime
    pub force: bool,

    /// Simulated transfer rate in KB/s; 0 copies for real
    pub simulate_rate: u64,

    /// Copy buffer size
    pub buffer_size: usize,

    /// Retries for a failed copy
    pub retry_count: u32,

    /// Pause between retries
    pub retry_delay: Duration,
}

impl DispatchConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: &CopyArgs, quiet: bool, verbose: bool) -> Result<Self, ConfigError> {
        let walk = WalkConfig::from_args(&args.walk, true, quiet, verbose)?;
        let dst = Location::parse(&args.dst)?;

        if dst.is_within(&walk.src) {
            return Err(ConfigError::NestedDestination {
                src: walk.src.absolute(),
                dst: dst.absolute(),
            });
        }

        let worker_count = args.copy_workers.unwrap_or(walk.worker_count);
        validate_workers(worker_count)?;

        if args.buffer_size < MIN_BUFFER_SIZE || args.buffer_size > MAX_BUFFER_SIZE {
            return Err(ConfigError::InvalidBufferSize {
                size: args.buffer_size,
                min: MIN_BUFFER_SIZE,
                max: MAX_BUFFER_SIZE,
            });
        }

        Ok(Self {
            walk,
            dst,
            worker_count,
            skip_existing: args.skip_existing,
            force: args.force,
            simulate_rate: args.simulate.unwrap_or(0),
            buffer_size: args.buffer_size,
            retry_count: args.retries,
            retry_delay: Duration::from_secs(args.retry_delay),
        })
    }

    /// Dispatcher tuning for this copy
    pub fn options(&self) -> DispatchOptions {
        DispatchOptions {
            parallelism: self.worker_count,
            queue_capacity: self.worker_count * 4,
            simulate_rate: self.simulate_rate,
            buffer_size: self.buffer_size,
            retry_max: self.retry_count,
            retry_delay: self.retry_delay,
            ..DispatchOptions::default()
        }
    }
}

/// Validated configuration for a replicate run
#[derive(Debug, Clone)]
pub struct ReplicateConfig {
    /// The source walk
    pub walk: WalkConfig,

    /// Number of transfer workers
    pub worker_count: usize,

    /// What to schedule
    pub plan: ReplicateOptions,

    /// Simulated transfer rate in KB/s; 0 transfers for real
    pub simulate_rate: u64,

    /// Retries for a failed replication
    pub retry_count: u32,

    /// Pause between retries
    pub retry_delay: Duration,
}

impl ReplicateConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_args(
        args: &ReplicateArgs,
        quiet: bool,
        verbose: bool,
    ) -> Result<Self, ConfigError> {
        let walk = WalkConfig::from_args(&args.walk, true, quiet, verbose)?;
        let worker_count = args.copy_workers.unwrap_or(walk.worker_count);
        validate_workers(worker_count)?;

        let conflict = |reason: &str| {
            Err(ConfigError::ConflictingOptions {
                reason: reason.to_string(),
            })
        };
        if args.copies == 0 {
            return conflict("-N must be at least 1");
        }
        if args.migrate {
            if args.copies > 1 {
                return conflict("either -N or -m, not both");
            }
            if args.remove_excess {
                return conflict("-m does not take -x");
            }
            if args.src_domain.is_none() && args.dst_domain.is_none() {
                return conflict("-m needs -S or -D");
            }
        }
        if args.max_rw == 0 {
            return conflict("--max-rw must be at least 1");
        }
        if let (Some(min), Some(max)) = (args.min_size, args.max_size) {
            if min > max {
                return conflict("-z is larger than -Z");
            }
        }

        Ok(Self {
            walk,
            worker_count,
            plan: ReplicateOptions {
                copies: args.copies,
                migrate: args.migrate,
                remove_excess: args.remove_excess,
                src_domain: args.src_domain.clone().filter(|d| !d.is_empty()),
                dst_domain: args.dst_domain.clone().filter(|d| !d.is_empty()),
                max_rw: args.max_rw,
                min_size: args.min_size,
                max_size: args.max_size,
                max_total: args.max_total,
                minimum_free: args.minimum_free,
            },
            simulate_rate: args.simulate.unwrap_or(0),
            retry_count: args.retries,
            retry_delay: Duration::from_secs(args.retry_delay),
        })
    }

    /// Dispatcher tuning for this run
    pub fn options(&self) -> DispatchOptions {
        DispatchOptions {
            parallelism: self.worker_count,
            queue_capacity: self.worker_count * 4,
            simulate_rate: self.simulate_rate,
            retry_max: self.retry_count,
            retry_delay: self.retry_delay,
            minimum_free: self.plan.minimum_free,
            ..DispatchOptions::default()
        }
    }
}

fn validate_workers(count: usize) -> Result<(), ConfigError> {
    if count == 0 || count > MAX_WORKERS {
        return Err(ConfigError::InvalidWorkerCount {
            count,
            max: MAX_WORKERS,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_parse_plain_path() {
        let loc = Location::parse("/data/src/").unwrap();
        assert_eq!(loc.scheme, "file");
        assert_eq!(loc.path, "/data/src");
    }

    #[test]
    fn test_parse_file_url() {
        let loc = Location::parse("file:///data").unwrap();
        assert_eq!(loc.path, "/data");
        assert_eq!(loc.to_string(), "file:///data");
        assert_eq!(Location::parse("file:///").unwrap().path, "/");
    }

    #[test]
    fn test_parse_invalid_location() {
        assert!(Location::parse("").is_err());
        assert!(matches!(
            Location::parse("nfs://server/export"),
            Err(ConfigError::InvalidLocation { .. })
        ));
    }

    #[test]
    fn test_list_args() {
        let args = parse(&[
            "bulkmove",
            "list",
            "/data",
            "-r",
            "-j",
            "4",
            "--exclude",
            r"\.snapshot",
        ]);
        let CliCommand::List(list) = &args.command else {
            panic!("expected list");
        };
        let config =
            WalkConfig::from_args(&list.walk, list.recursive, args.quiet, args.verbose).unwrap();
        assert!(config.recursive);
        assert_eq!(config.worker_count, 4);
        assert!(config.is_excluded("a/.snapshot/hourly.0"));
        assert!(!config.is_excluded("a/file.txt"));
    }

    #[test]
    fn test_invalid_worker_count() {
        let args = parse(&["bulkmove", "list", "/data", "-j", "0"]);
        let CliCommand::List(list) = &args.command else {
            panic!("expected list");
        };
        assert!(matches!(
            WalkConfig::from_args(&list.walk, false, false, false),
            Err(ConfigError::InvalidWorkerCount { count: 0, .. })
        ));
    }

    #[test]
    fn test_invalid_exclude_pattern() {
        let args = parse(&["bulkmove", "list", "/data", "--exclude", "("]);
        let CliCommand::List(list) = &args.command else {
            panic!("expected list");
        };
        assert!(matches!(
            WalkConfig::from_args(&list.walk, false, false, false),
            Err(ConfigError::InvalidExcludePattern { .. })
        ));
    }

    #[test]
    fn test_copy_args() {
        let args = parse(&[
            "bulkmove", "copy", "/data", "/backup", "-j", "8", "--copy-workers", "2",
            "--skip-existing", "--simulate", "500",
        ]);
        let CliCommand::Copy(copy) = &args.command else {
            panic!("expected copy");
        };
        let config = DispatchConfig::from_args(copy, true, false).unwrap();
        assert!(config.walk.recursive);
        assert!(!config.walk.show_progress);
        assert_eq!(config.walk.worker_count, 8);
        assert_eq!(config.worker_count, 2);
        assert!(config.skip_existing);
        assert!(!config.force);

        let options = config.options();
        assert_eq!(options.parallelism, 2);
        assert_eq!(options.simulate_rate, 500);
        assert_eq!(options.retry_max, 2);
    }

    #[test]
    fn test_copy_force_flag() {
        let args = parse(&["bulkmove", "copy", "/a", "/b", "-f"]);
        let CliCommand::Copy(copy) = &args.command else {
            panic!("expected copy");
        };
        assert!(DispatchConfig::from_args(copy, false, false).unwrap().force);
    }

    #[test]
    fn test_replicate_args() {
        let args = parse(&[
            "bulkmove", "replicate", "/data", "-N", "3", "-x", "-z", "1", "-Z", "4096", "-M",
            "1000000", "--max-rw", "2", "-D", "",
        ]);
        let CliCommand::Replicate(rep) = &args.command else {
            panic!("expected replicate");
        };
        let config = ReplicateConfig::from_args(rep, false, false).unwrap();
        assert_eq!(config.plan.copies, 3);
        assert!(config.plan.remove_excess);
        assert_eq!(config.plan.min_size, Some(1));
        assert_eq!(config.plan.max_size, Some(4096));
        assert_eq!(config.plan.max_total, Some(1_000_000));
        assert_eq!(config.plan.max_rw, 2);
        // an empty domain selects every host
        assert_eq!(config.plan.dst_domain, None);
    }

    #[test]
    fn test_replicate_conflicts() {
        for argv in [
            &["bulkmove", "replicate", "/d", "-m", "-N", "2", "-S", "a"][..],
            &["bulkmove", "replicate", "/d", "-m", "-x", "-S", "a"][..],
            &["bulkmove", "replicate", "/d", "-m"][..],
            &["bulkmove", "replicate", "/d", "-N", "0"][..],
            &["bulkmove", "replicate", "/d", "-z", "10", "-Z", "5"][..],
        ] {
            let args = parse(argv);
            let CliCommand::Replicate(rep) = &args.command else {
                panic!("expected replicate");
            };
            assert!(matches!(
                ReplicateConfig::from_args(rep, false, false),
                Err(ConfigError::ConflictingOptions { .. })
            ));
        }
    }

    #[test]
    fn test_nested_destination_rejected() {
        let args = parse(&["bulkmove", "copy", "/data", "/data/backup"]);
        let CliCommand::Copy(copy) = &args.command else {
            panic!("expected copy");
        };
        assert!(matches!(
            DispatchConfig::from_args(copy, false, false),
            Err(ConfigError::NestedDestination { .. })
        ));
    }

    #[test]
    fn test_sibling_destination_allowed() {
        let src = Location::parse("/data").unwrap();
        assert!(!Location::parse("/data2").unwrap().is_within(&src));
        assert!(Location::parse("/data").unwrap().is_within(&src));
    }

    #[test]
    fn test_buffer_size_limits() {
        let args = parse(&["bulkmove", "copy", "/a", "/b", "--buffer-size", "10"]);
        let CliCommand::Copy(copy) = &args.command else {
            panic!("expected copy");
        };
        assert!(matches!(
            DispatchConfig::from_args(copy, false, false),
            Err(ConfigError::InvalidBufferSize { size: 10, .. })
        ));
    }
}
