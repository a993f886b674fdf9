//! Engine configuration and the scoped context that owns process-wide
//! resources (worker pool, user-defined function registry).

use serde::{Deserialize, Serialize};

use crate::expr::UdfRegistry;
use crate::{Error, Result};

/// Compression codec selected in the codec facade.
///
/// `Zlib` and `Zstd` are always available; the blosc family needs the
/// `blosc` cargo feature. `Lizard` has no binding and is rejected at
/// container construction.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CodecId {
    BloscLz,
    Lz4,
    Lz4hc,
    Snappy,
    Zlib,
    Zstd,
    Lizard,
}

/// One stage of the filter pipeline applied to each block before
/// compression (and undone, in reverse order, after decompression).
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Filter {
    /// Byte transposition across items.
    Shuffle,
    /// Bit transposition across items.
    BitShuffle,
    /// XOR every item against the block's first item.
    Delta,
    /// Zero low mantissa bits of 64-bit floats; lossy, one-way.
    TruncPrec,
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EvalStrategy {
    /// Decompress whole chunks of every operand, evaluate flat panels.
    #[default]
    Chunk,
    /// Decode one block per operand at a time; basis for block-parallel
    /// execution.
    Block,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub codec: CodecId,
    /// 0 disables compression entirely.
    pub level: u8,
    pub filters: Vec<Filter>,
    pub eval_strategy: EvalStrategy,
    pub max_num_threads: usize,
    /// Mantissa bits kept by [Filter::TruncPrec].
    pub fp_mantissa_bits: u8,
    /// Advisory codec block size in bytes, used when a shape does not pick
    /// an explicit block shape.
    pub block_size_hint: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            codec: CodecId::Zlib,
            level: 5,
            filters: Vec::default(),
            eval_strategy: EvalStrategy::default(),
            max_num_threads: 1,
            fp_mantissa_bits: 0,
            block_size_hint: 0,
        }
    }
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.level > 9 {
            return Err(Error::invalid_argument("compression level must be 0..=9"));
        }
        if self.max_num_threads == 0 {
            return Err(Error::invalid_argument("max_num_threads must be >= 1"));
        }
        Ok(())
    }
}

/// Owner of everything with process-wide flavour: the configuration, the
/// worker pool for block-parallel phases, and the registry of user-defined
/// expression functions.
///
/// Containers and expressions borrow the context, so nothing can outlive it.
pub struct Context {
    cfg: Config,
    pool: Option<rayon::ThreadPool>,
    udfs: UdfRegistry,
}

impl Context {
    pub fn new(cfg: Config) -> Result<Self> {
        cfg.validate()?;
        let pool = if cfg.max_num_threads > 1 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(cfg.max_num_threads)
                    .build()
                    .map_err(|e| Error::invalid_argument(e.to_string()))?,
            )
        } else {
            None
        };
        Ok(Self {
            cfg,
            pool,
            udfs: UdfRegistry::default(),
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(Config::default())
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Register a user-defined expression function of the given arity
    /// (0..=7). Returns its registry id.
    pub fn register_udf<F>(&mut self, name: &str, arity: usize, f: F) -> Result<usize>
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
    {
        self.udfs.register(name, arity, f)
    }

    pub(crate) fn udfs(&self) -> &UdfRegistry {
        &self.udfs
    }

    /// Whether block-level work should fan out over the worker pool.
    pub(crate) fn parallel(&self) -> bool {
        self.pool.is_some()
    }

    /// Run `f` inside the context's worker pool, if there is one.
    pub(crate) fn install<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }
}
