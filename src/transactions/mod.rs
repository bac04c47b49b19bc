//! Write path: batching, change tracking, the durable transaction log and recovery

pub mod batch;
pub mod codec;
pub mod fatal;
pub mod log;
pub mod pipeline;
pub mod record;
pub mod recovery;
pub mod tracker;

pub use batch::{BatchCommitScheduler, WriteContext};
pub use codec::{BincodeCodec, CodecKind, TextCodec, TransactionCodec};
pub use fatal::{ProcessTerminator, Terminator};
pub use self::log::{LocalTransactionLog, ShardLayout};
pub use pipeline::{CommitPipeline, Projection};
pub use record::{CollectingListener, RecordListener, TransactionRecord};
pub use recovery::restore;
pub use tracker::{ChangeTracker, TrackedChanges, TrackingMode};
