pub mod backend;
pub mod config;
pub mod documents;
pub mod errors;
pub mod model;
pub mod notifier;
pub mod partition;
pub mod retry;
pub mod shard;
pub mod store;

pub use config::{load_config, AccessMode, StoreConfig};
pub use errors::{BackendError, ExpStoreError, Result};
pub use model::{Delta, Expectations, Id, Label, TriageHistory, TriageLogEntry};
pub use notifier::{ChangeNotifier, ChannelNotifier};
pub use partition::Partition;
pub use store::{Clock, ExpectationsStore};
