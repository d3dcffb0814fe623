pub mod snapshot;
mod store;

pub use snapshot::{SnapshotWriter, load_snapshot};
pub use store::{SessionUpsert, SessionsPage, Store, WriteOutcome};
