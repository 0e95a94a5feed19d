//! # KoruChain: Persistent Sharded Markov Chains
//!
//! KoruChain stores weighted Markov-chain transitions on disk and generates
//! sequences from them:
//! - **Tagged training** - Every edge remembers the tags it was learned under
//! - **Biased generation** - Tag queries filter and score candidate tokens
//! - **Bounded memory** - Edges live in partitions that open on demand and
//!   close when idle
//! - **Online growth** - Partitions split in the background without blocking
//!   reads or losing writes
//!
//! ## Quick Start
//!
//! ```ignore
//! use koru_chain::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let model = ModelHandle::load("/tmp/poems", ModelOptions::default()).await?;
//!
//!     let line = "roses are red".split(' ').map(Token::text).collect();
//!     model.train(line, vec![Tag::symbol("poem")]).await?;
//!
//!     let out = model.generate(TagQuery::tag("poem")).await?;
//!     println!("{:?}", out);
//!
//!     model.unload().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Core API
//!
//! - [`ModelHandle::load()`] - Open or create a model and start its actor
//! - [`ModelHandle::train()`] - Learn a token sequence under a set of tags
//! - [`ModelHandle::generate()`] - Walk the chain from the start context
//! - [`ModelHandle::configure()`] - Change mutable options
//! - [`ModelHandle::unload()`] - Persist and stop
//!
//! ## Architecture
//!
//! 1. **Model actor** (`core`) - Single writer per model, serialized inbox
//! 2. **Model core** (`model`) - Train, generate, resharding commits
//! 3. **Partitioning** (`ring`, `cache`, `reshard`) - Consistent hashing,
//!    idle eviction and online splitting
//! 4. **Edge storage** (`storage`, `persistence`) - Partition files and
//!    control state
//!
//! ## Thread Safety
//!
//! A [`ModelHandle`] is a cheap clone around the actor's inbox. Any number of
//! tasks may hold one; their calls are applied one at a time in arrival order.

// Internal modules
mod core;
mod error;

pub mod cache;
pub mod history;
pub mod model;
pub mod options;
pub mod persistence;
pub mod query;
pub mod reshard;
pub mod ring;
pub mod shift;
pub mod storage;
pub mod transition;
pub mod types;

// Public API exports
pub use crate::core::ModelHandle;
pub use error::{ChainError, ChainResult};
pub use history::{read_records, EventKind, EventPayload, HistoryRecord};
pub use model::{ModelStats, TrainOutcome};
pub use options::{ModelOptions, OptionsUpdate};
pub use query::TagQuery;
pub use ring::PartitionId;
pub use transition::DEFAULT_STEP_LIMIT;
pub use types::{Context, EdgeRecord, Tag, Token};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use koru_chain::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::ModelHandle;
    pub use crate::error::{ChainError, ChainResult};
    pub use crate::model::{ModelStats, TrainOutcome};
    pub use crate::options::{ModelOptions, OptionsUpdate};
    pub use crate::query::TagQuery;
    pub use crate::types::{Context, Tag, Token};
}
