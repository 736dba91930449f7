//! Declarative shard configuration.
//!
//! A `sharding_configuration.json` file assigns test targets to shards, per
//! platform:
//!
//! ```json
//! {
//!   "android": [ { "nplb": [1, 2], "base_unittests": "*" }, { "nplb": [2, 2] } ],
//!   "default": [ { "renderer_test": "*" } ]
//! }
//! ```
//!
//! The platform key is matched as a substring of the running platform name,
//! in file order, falling back to `"default"`. The listed shards are the
//! explicit shards `1..=N`; shard `0` is synthesized at load time and
//! receives every target that appears nowhere else, plus the single missing
//! chunk of any partially placed target. Loading fails when the default shard
//! would have to hold two chunks of the same target.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

/// Default file name, looked up next to the runner configuration.
pub const SHARDING_CONFIG_FILE: &str = "sharding_configuration.json";

const DEFAULT_PLATFORM_KEY: &str = "default";

/// Errors raised while loading or querying a shard configuration.
#[derive(Debug, thiserror::Error)]
pub enum ShardingError {
    /// The file could not be read.
    #[error("failed to read sharding config {path}: {source}")]
    Io {
        /// File that failed to load.
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON or has the wrong shape.
    #[error("failed to parse sharding config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A chunk pair outside `1 <= index <= total`.
    #[error("invalid chunk [{index}, {total}] for {test}")]
    InvalidChunk {
        /// Target with the bad chunk.
        test: String,
        /// 1-based chunk index.
        index: usize,
        /// Chunk count.
        total: usize,
    },

    /// The same chunk of a target was placed in more than one shard.
    #[error("chunk {index} of {test} is placed more than once")]
    DuplicateChunk {
        /// Target with the duplicate chunk.
        test: String,
        /// 1-based chunk index.
        index: usize,
    },

    /// A target is placed as `"*"` more than once, or both as `"*"` and in chunks.
    #[error("{test} is placed in more than one shard")]
    DuplicatePlacement {
        /// Target placed twice.
        test: String,
    },

    /// Chunks of one target disagree on the chunk count.
    #[error("chunks of {test} disagree on the chunk count ({first} vs {second})")]
    InconsistentTotal {
        /// Target with inconsistent chunk counts.
        test: String,
        /// Count seen first.
        first: usize,
        /// Conflicting count.
        second: usize,
    },

    /// The default shard would need more than one chunk of `test`.
    #[error("default shard would need chunks {missing:?} of {test}")]
    AmbiguousDefault {
        /// Target with more than one unplaced chunk.
        test: String,
        /// The unplaced 1-based chunk indices.
        missing: Vec<usize>,
    },

    /// Query for a shard that does not exist.
    #[error("shard index {index} out of range (shard count {count})")]
    ShardIndexOutOfRange {
        /// Requested shard.
        index: usize,
        /// Number of shards, including the default shard.
        count: usize,
    },
}

/// Placement of one target within one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawShardSpec")]
pub enum ShardSpec {
    /// Run every case of the target on this shard (`"*"`).
    All,
    /// Run 1-based chunk `index` of `total` (`[index, total]`).
    Chunk {
        /// 1-based chunk index.
        index: usize,
        /// Chunk count.
        total: usize,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawShardSpec {
    Star(String),
    Chunk(usize, usize),
}

impl TryFrom<RawShardSpec> for ShardSpec {
    type Error = String;

    fn try_from(raw: RawShardSpec) -> Result<Self, Self::Error> {
        match raw {
            RawShardSpec::Star(s) if s == "*" => Ok(ShardSpec::All),
            RawShardSpec::Star(s) => Err(format!("expected \"*\" or [index, total], got {:?}", s)),
            RawShardSpec::Chunk(index, total) => Ok(ShardSpec::Chunk { index, total }),
        }
    }
}

/// One shard: target name to placement.
pub type Shard = BTreeMap<String, ShardSpec>;

/// What a runner assigned to a given shard should do with a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestRunConfig {
    /// The target is not on this shard.
    Skip,
    /// Run every case of the target.
    RunFull,
    /// Run 0-based gtest shard `index` of `total`.
    RunPartial {
        /// 0-based gtest shard index.
        index: usize,
        /// gtest shard count.
        total: usize,
    },
}

/// Shards for one platform, with the synthesized default at index 0.
#[derive(Debug, Clone)]
pub struct ShardingConfig {
    shards: Vec<Shard>,
}

impl ShardingConfig {
    /// Loads the shards for `platform` from a JSON file.
    ///
    /// Returns `Ok(None)` when neither a matching platform key nor a
    /// `"default"` key exists.
    pub fn load(
        path: &Path,
        platform: &str,
        test_targets: &[String],
    ) -> Result<Option<Self>, ShardingError> {
        let content = std::fs::read_to_string(path).map_err(|source| ShardingError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content, platform, test_targets)
    }

    /// Parses the shards for `platform` from JSON text.
    pub fn from_json(
        json: &str,
        platform: &str,
        test_targets: &[String],
    ) -> Result<Option<Self>, ShardingError> {
        let document: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json)?;

        let matched = document
            .iter()
            .find(|(key, _)| key.as_str() != DEFAULT_PLATFORM_KEY && platform.contains(key.as_str()))
            .or_else(|| document.get_key_value(DEFAULT_PLATFORM_KEY));

        let Some((key, value)) = matched else {
            return Ok(None);
        };
        debug!("Using sharding config key '{}' for platform {}", key, platform);

        let explicit: Vec<Shard> = serde_json::from_value(value.clone())?;
        Self::from_shards(explicit, test_targets).map(Some)
    }

    /// Builds a configuration from explicit shards `1..=N`.
    pub fn from_shards(explicit: Vec<Shard>, test_targets: &[String]) -> Result<Self, ShardingError> {
        let mut full: BTreeSet<&str> = BTreeSet::new();
        let mut chunks: BTreeMap<&str, (usize, BTreeSet<usize>)> = BTreeMap::new();

        for shard in &explicit {
            for (test, spec) in shard {
                match *spec {
                    ShardSpec::All => {
                        if chunks.contains_key(test.as_str()) || !full.insert(test) {
                            return Err(ShardingError::DuplicatePlacement { test: test.clone() });
                        }
                    }
                    ShardSpec::Chunk { index, total } => {
                        if index == 0 || index > total {
                            return Err(ShardingError::InvalidChunk {
                                test: test.clone(),
                                index,
                                total,
                            });
                        }
                        if full.contains(test.as_str()) {
                            return Err(ShardingError::DuplicatePlacement { test: test.clone() });
                        }
                        let (known_total, placed) = chunks
                            .entry(test.as_str())
                            .or_insert_with(|| (total, BTreeSet::new()));
                        if *known_total != total {
                            return Err(ShardingError::InconsistentTotal {
                                test: test.clone(),
                                first: *known_total,
                                second: total,
                            });
                        }
                        if !placed.insert(index) {
                            return Err(ShardingError::DuplicateChunk {
                                test: test.clone(),
                                index,
                            });
                        }
                    }
                }
            }
        }

        let mut default_shard = Shard::new();

        for target in test_targets {
            if !full.contains(target.as_str()) && !chunks.contains_key(target.as_str()) {
                default_shard.insert(target.clone(), ShardSpec::All);
            }
        }

        for (test, (total, placed)) in &chunks {
            let missing: Vec<usize> = (1..=*total).filter(|i| !placed.contains(i)).collect();
            match missing.as_slice() {
                [] => {}
                [index] => {
                    default_shard.insert(
                        test.to_string(),
                        ShardSpec::Chunk {
                            index: *index,
                            total: *total,
                        },
                    );
                }
                _ => {
                    return Err(ShardingError::AmbiguousDefault {
                        test: test.to_string(),
                        missing,
                    });
                }
            }
        }

        let mut shards = Vec::with_capacity(explicit.len() + 1);
        shards.push(default_shard);
        shards.extend(explicit);
        Ok(Self { shards })
    }

    /// Number of shards, including the default shard.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// The synthesized shard 0.
    pub fn default_shard(&self) -> &Shard {
        &self.shards[0]
    }

    /// Decides what shard `shard_index` does with `test`.
    pub fn test_run_config(
        &self,
        test: &str,
        shard_index: usize,
    ) -> Result<TestRunConfig, ShardingError> {
        let shard = self
            .shards
            .get(shard_index)
            .ok_or(ShardingError::ShardIndexOutOfRange {
                index: shard_index,
                count: self.shards.len(),
            })?;

        Ok(match shard.get(test) {
            None => TestRunConfig::Skip,
            Some(ShardSpec::All) => TestRunConfig::RunFull,
            Some(ShardSpec::Chunk { index, total }) => TestRunConfig::RunPartial {
                index: index - 1,
                total: *total,
            },
        })
    }
}
