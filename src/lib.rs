//! # scr-ldx
//!
//! Form-data backend for the racing team's data logger. Subteams submit
//! structured values over HTTP; a background watch loop merges the latest
//! values into every new LDX configuration file dropped into the watch
//! directory, keeping an injection log of each write. A simulated telemetry
//! source feeds the live dashboard over a websocket.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use scr_ldx::{ldx::MergeEngine, schema::FormRegistry, storage};
//!
//! fn main() -> anyhow::Result<()> {
//!     let db = storage::open(Path::new("data/app.db"))?;
//!     let forms = FormRegistry::load_dir(Path::new("forms"))?;
//!
//!     let outcome = MergeEngine::new(db.as_ref(), &forms).merge(Path::new("runs/run_01.ldx"))?;
//!     println!("{} tags written", outcome.entries.len());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod ldx;
pub mod logging;
pub mod schema;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod watcher;

// Re-export main types for library consumers
pub use config::Config;
pub use error::{ErrorCategory, MergeError};
pub use ldx::{MergeEngine, MergeOutcome};
pub use schema::{FormRegistry, SchemaProvider};
pub use storage::{Database, FormValueStore, ValueProvider};
pub use watcher::{LdxWatcher, ScanReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
