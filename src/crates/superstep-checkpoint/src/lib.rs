//! # superstep-checkpoint - Channels and State Persistence
//!
//! Versioned channels, the checkpoint data model and the storage backends used
//! by the `superstep-core` execution engine.
//!
//! ## Channels
//!
//! A channel holds one piece of graph state and decides how the writes of a
//! superstep are merged into it:
//!
//! - [`LastValueChannel`] - single value, last write in task order wins
//! - [`TopicChannel`] - list of values, reset each round unless accumulating
//! - [`BinaryOperatorChannel`] - folds writes with a reducer (sum, append, custom)
//! - [`EphemeralValueChannel`] - value visible for exactly one round
//! - [`NamedBarrierValueChannel`] - available once every named source wrote
//!
//! ## Checkpoints
//!
//! A [`Checkpoint`] snapshots every channel after a superstep, together with
//! channel versions and the versions each node has already seen. Checkpoints
//! are stored by a [`CheckpointSaver`]:
//!
//! - [`InMemoryCheckpointSaver`] - process-local, used by default and in tests
//! - [`FileCheckpointSaver`] - one directory per checkpoint, atomic renames
//! - `SqliteCheckpointSaver` - SQLite through `sqlx` (feature `sqlite`, on by default)
//!
//! Persistent savers serialize through a [`SerializerProtocol`]; wrapping the
//! default [`JsonSerializer`] in an [`EncryptedSerializer`] encrypts everything
//! at rest.
//!
//! ```rust,no_run
//! use superstep_checkpoint::{
//!     Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver,
//!     InMemoryCheckpointSaver,
//! };
//! use std::collections::HashMap;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let saver = InMemoryCheckpointSaver::new();
//!     let thread = CheckpointConfig::new().with_thread_id("thread-123");
//!
//!     let saved = saver
//!         .put(&thread, Checkpoint::empty(), CheckpointMetadata::new(), HashMap::new())
//!         .await?;
//!     let latest = saver.get_tuple(&thread).await?;
//!     assert_eq!(latest.map(|t| t.config), Some(saved));
//!     Ok(())
//! }
//! ```

pub mod channels;
pub mod channels_ext;
pub mod checkpoint;
pub mod encrypted;
pub mod error;
pub mod file;
pub mod memory;
pub mod serializer;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod traits;

pub use channels::{BinaryOperatorChannel, Channel, LastValueChannel, ReducerFn, TopicChannel};
pub use channels_ext::{EphemeralValueChannel, NamedBarrierValueChannel};
pub use checkpoint::{
    new_checkpoint_id, ChannelVersion, ChannelVersions, Checkpoint, CheckpointConfig,
    CheckpointId, CheckpointMetadata, CheckpointSource, CheckpointTuple, PendingWrite,
};
pub use encrypted::{AesGcmCipher, Cipher, EncryptedSerializer};
pub use error::{CheckpointError, Result};
pub use file::FileCheckpointSaver;
pub use memory::InMemoryCheckpointSaver;
pub use serializer::{JsonSerializer, SerializerProtocol};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCheckpointSaver;
pub use traits::CheckpointSaver;
