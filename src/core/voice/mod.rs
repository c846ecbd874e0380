//! Speech generation: text preparation, synthesis providers, the generation
//! queue and the audio cache.

pub mod cache;
pub mod codec;
pub mod fsio;
pub mod preprocess;
pub mod providers;
pub mod queue;
pub mod service;
pub mod types;

pub use cache::AudioCache;
pub use service::{GenerationService, ServiceOptions};
pub use types::{GenerationError, GenerationTask, TaskPriority, TaskStatus};
