pub mod logging;
pub mod playback;
pub mod server;
pub mod streaming;
pub mod voice;
