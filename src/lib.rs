//! Commit-log message store.
//!
//! Every message is appended to one sequential commit log. Per (topic, queue)
//! consume queues and a key index point back into it, background services
//! flush, dispatch and reclaim disk, and a master streams its raw log bytes
//! to slaves.

pub mod allocate;
pub mod checkpoint;
pub mod cleanup;
pub mod clock;
pub mod commit_log;
pub mod config;
pub mod consume_queue;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod flags;
mod flush;
pub mod ha;
pub mod index;
pub mod mapped_file;
pub mod mapped_file_queue;
pub mod message;
pub mod service;
pub mod stats;
pub mod store;

pub use clock::{Clock, QuantaClock, SystemClock};
pub use commit_log::{AppendMessageResult, PutMessageResult, PutMessageStatus};
pub use config::{BrokerRole, FlushDiskType, StoreConfig};
pub use error::{Error, Result};
pub use filter::{ExpressionFilter, MessageFilter, TagFilter};
pub use message::{Message, MessageExt};
pub use store::{GetMessageResult, GetMessageStatus, MessageStore, QueryMessageResult};
