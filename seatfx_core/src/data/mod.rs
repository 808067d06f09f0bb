//! Batches, loaders and the synthetic seating dataset.

pub mod batch;
pub mod loader;
pub mod synthetic;

pub use batch::{Batch, ZoneKey};
pub use loader::{BatchLoader, InMemoryLoader, LoaderSet};
pub use synthetic::{zone_positions, SeatingDataset, SyntheticConfig, Unit};
