use std::path::PathBuf;

/// What to do when a page fails its checksum on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionPolicy {
    /// Propagate the corruption to the caller.
    Raise,
    /// Heap pages are re-initialized, index pages are queued for reindex.
    Ignore,
}

impl CorruptionPolicy {
    fn parse(value: &str) -> CorruptionPolicy {
        if value.eq_ignore_ascii_case("ignore") {
            CorruptionPolicy::Ignore
        } else {
            CorruptionPolicy::Raise
        }
    }
}

/// Commit durability contract for a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitType {
    /// Block until DBWriter has logged and flushed the commit.
    Synced,
    /// Record the status bits in place and return; durability is deferred
    /// to the next writer pass.
    Soft,
}

/// Database configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Root directory for relation files and shadow logs.
    pub data_dir: PathBuf,

    /// Number of shared buffer frames.
    pub buffers: usize,

    /// Milliseconds DBWriter waits for more commits before processing a
    /// partially filled write group.
    pub timeout_ms: u64,

    /// Milliseconds between forced sync passes when only sync-only
    /// buffers are pending.
    pub sync_timeout_ms: u64,

    /// Maximum buffers DBWriter will defer into the sync accumulator
    /// before forcing a data-page sync pass. Zero means "buffer count".
    pub max_logcount: usize,

    /// Maximum transactions accepted into one write group.
    pub max_trans_per_group: usize,

    /// Shadow logging on or off. Off forces every commit to be synced.
    pub logging: bool,

    /// Default commit durability for new transactions.
    pub commit_type: CommitType,

    pub heap_corruption: CorruptionPolicy,
    pub index_corruption: CorruptionPolicy,

    /// Accumulated commit pressure at which a relation is handed to the
    /// poolsweep for vacuum.
    pub vacuum_threshold: f64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            buffers: 256,
            timeout_ms: 400,
            sync_timeout_ms: 5000,
            max_logcount: 0,
            max_trans_per_group: 64,
            logging: true,
            commit_type: CommitType::Synced,
            heap_corruption: CorruptionPolicy::Raise,
            index_corruption: CorruptionPolicy::Raise,
            vacuum_threshold: 64.0,
        }
    }
}

impl DbConfig {
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Apply the environment-variable overrides. Unparsable values keep
    /// the defaults.
    pub fn from_env<P: Into<PathBuf>>(data_dir: P) -> Self {
        let mut cfg = Self::new(data_dir);
        if let Ok(v) = std::env::var("synctimeout") {
            if let Ok(ms) = v.trim().parse::<u64>() {
                if ms > 0 {
                    cfg.sync_timeout_ms = ms;
                }
            }
        }
        if let Ok(v) = std::env::var("maxlogcount") {
            if let Ok(n) = v.trim().parse::<usize>() {
                cfg.max_logcount = n;
            }
        }
        if let Ok(v) = std::env::var("heap_corruption") {
            cfg.heap_corruption = CorruptionPolicy::parse(&v);
        }
        if let Ok(v) = std::env::var("index_corruption") {
            cfg.index_corruption = CorruptionPolicy::parse(&v);
        }
        cfg
    }

    pub fn effective_max_logcount(&self) -> usize {
        if self.max_logcount == 0 {
            self.buffers
        } else {
            self.max_logcount
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = DbConfig::default();
        assert_eq!(cfg.sync_timeout_ms, 5000);
        assert_eq!(cfg.timeout_ms, 400);
        assert_eq!(cfg.effective_max_logcount(), cfg.buffers);
        assert_eq!(cfg.heap_corruption, CorruptionPolicy::Raise);
    }

    #[test]
    fn corruption_policy_parse_is_case_insensitive() {
        assert_eq!(CorruptionPolicy::parse("IGNORE"), CorruptionPolicy::Ignore);
        assert_eq!(CorruptionPolicy::parse("ignore"), CorruptionPolicy::Ignore);
        assert_eq!(CorruptionPolicy::parse("strict"), CorruptionPolicy::Raise);
    }
}
