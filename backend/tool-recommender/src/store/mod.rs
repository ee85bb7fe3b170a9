//! In-memory stores behind the engine: the append-only interaction log,
//! user/tool profiles and the tool catalog boundary.

pub mod catalog;
pub mod interactions;
pub mod profiles;

pub use catalog::{InMemoryCatalog, ToolCatalog, ToolMetadata};
pub use interactions::{AppendOutcome, InteractionStore, LoggedInteraction, Sequence};
pub use profiles::ProfileStore;
