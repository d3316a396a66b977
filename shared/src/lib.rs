//! ==============================================================================
//! lib.rs - shared logic for the whatif.diy workers
//! ==============================================================================
//!
//! purpose:
//!     everything the workers have in common that does not need the workers
//!     runtime: client identification, usage accounting, settings, content
//!     policy, the analysis prompt and the key-value store seam. keeping it
//!     host-independent means all of it is unit tested natively.
//!
//! relationships:
//!     - used by: kv-rest (KvStore, StoreError)
//!     - used by: workers/check-usage (counters, usage, identity)
//!     - used by: workers/user-data (profile, settings, usage, identity)
//!     - used by: workers/user-settings (settings, identity)
//!     - used by: workers/generate-analysis (policy, prompt, window, identity)
//!     - used by: workers/sitemap (sitemap)
//!
//! time:
//!     nothing in here reads the clock. workers take `Date.now()` once per
//!     request and pass a [`clock::Now`] down.
//!
//! ==============================================================================

pub mod clock;
pub mod config;
pub mod counters;
pub mod http;
pub mod identity;
pub mod policy;
pub mod profile;
pub mod prompt;
pub mod settings;
pub mod sitemap;
pub mod store;
pub mod usage;
pub mod window;

pub use clock::Now;
pub use config::{Limits, WindowConfig};
pub use store::{KvStore, MemoryStore, StoreError};
