//! Tunable budgets and limits, threaded through constructors.
//!
//! Every threshold the engine consults lives here so that tests can rebind
//! them without global state. [`Tunables::default`] matches the reference
//! configuration; [`Tunables::load`] reads overrides from a TOML file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Token budgets and operational limits for the knowledge core.
///
/// All token counts use the estimate from [`crate::tokens::estimate_tokens`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// Above this many tokens, a body is broken into multiple chunks.
    pub chunking_threshold: usize,

    /// Target upper bound for the text of a single chunk.
    ///
    /// Sized to the typical output token limit of contemporary LLMs, so that
    /// agents can rewrite a chunk in one completion.
    pub max_chunk: usize,

    /// Maximum tokens per group of observations sent to inference at once.
    pub group_threshold: usize,

    /// Above this many tokens, plain/data fragment text is trimmed.
    pub fragment_threshold: usize,

    /// Size the trimmed fragment text is reduced to.
    pub fragment_trimmed: usize,

    /// Above this many tokens, a spreadsheet is split into one chunk per sheet.
    pub spreadsheet_threshold: usize,

    /// Maximum tokens preserved per spreadsheet sheet chunk.
    pub spreadsheet_chunk_trimmed: usize,

    /// Number of pending reads executed concurrently per query batch.
    ///
    /// Capped to prevent a single request from overwhelming the service.
    pub batch_size: usize,

    /// Images with either side below this are discarded during ingestion,
    /// unless the whole fragment is a single image.
    pub image_min_side_px: u32,

    /// Images with either side above this are downscaled to fit, and the
    /// original resolution is preserved as a derived file bundle.
    pub image_max_side_px: u32,

    /// Maximum number of media blobs yielded inline to the LLM before the
    /// remainder are demoted to placeholders.
    pub limit_media: usize,

    /// Delays in seconds between retries of inference and downloader calls.
    ///
    /// The schedule length bounds the number of retries.
    pub retry_delay_secs: Vec<u64>,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            chunking_threshold: 20_000,
            max_chunk: 8_000,
            group_threshold: 80_000,
            fragment_threshold: 800_000,
            fragment_trimmed: 600_000,
            spreadsheet_threshold: 40_000,
            spreadsheet_chunk_trimmed: 20_000,
            batch_size: 20,
            image_min_side_px: 48,
            image_max_side_px: 1024,
            limit_media: 20,
            retry_delay_secs: vec![2, 30, 60],
        }
    }
}

impl Tunables {
    /// Load tunables from a TOML file, with defaults for absent fields.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// A configuration suited to unit tests: small budgets, no retry delays.
    #[must_use]
    pub fn for_tests() -> Self {
        Self {
            retry_delay_secs: Vec::new(),
            ..Self::default()
        }
    }
}
