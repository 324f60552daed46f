//! # TokenFold Core
//!
//! Domain types, traits, and error definitions for the TokenFold
//! token-reduction engine. The reduction engine, the ViT trunk, the config
//! loader and the CLI all depend inward on this crate.
//!
//! ## Layout
//!
//! - [`schedule`]: which stages reduce and their keep rates
//! - [`cache`]: cross-stage cache mode and recovery layers
//! - [`settings`]: raw reduction/cache settings as read from config files
//! - [`stage`]: the trait every processing stage implements
//! - [`arch`] / [`presets`]: trunk hyperparameters and the named catalog

pub mod arch;
pub mod cache;
pub mod error;
pub mod presets;
pub mod schedule;
pub mod settings;
pub mod stage;

// Re-export key types at crate root for ergonomics
pub use arch::{Activation, GlobalPool, IfaHeadConfig, MlpKind, NormKind, VitConfig};
pub use cache::{CacheMode, CachePolicy};
pub use error::{Error, Result};
pub use presets::{resolve_preset, PRESET_NAMES};
pub use schedule::{keep_count, validate_keep_rate, ReductionSchedule, FULL_KEEP};
pub use settings::{CacheSettings, ReductionSettings};
pub use stage::{SequenceStage, StageOutput};
