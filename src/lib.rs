/// voicecast - streaming speech synthesis
///
/// Server side: text is normalized and hashed, generated in segments by a
/// bounded worker pool, streamed to listeners as it is produced and cached
/// for replay. Client side: a playback engine schedules arriving chunks
/// gaplessly and switches to a buffered timeline once the listener pauses,
/// seeks or changes rate.

pub mod config;
pub mod core;

#[cfg(test)]
mod tests;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
