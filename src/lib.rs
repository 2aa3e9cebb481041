//! Receives GitHub webhooks, keeps a normalized history of push, pull request
//! and merge activity, and serves the most recent entries.

pub mod error;
pub mod normalize;
pub mod routes;
pub mod store;

pub use error::{ApiError, StoreError};
pub use normalize::{EventKind, EventSummary, NormalizedEvent, normalize};
pub use routes::{AppState, RECENT_LIMIT, router};
pub use store::{EventStore, StoredEvent};
