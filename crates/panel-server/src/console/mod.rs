//! Console engine: sequence-numbered log buffers, viewer fan-out, recording.

pub mod hub;
pub mod log_buffer;
pub mod recording;

pub use hub::{ConsoleHub, Subscription, SubscriptionGuard};
pub use log_buffer::LogBuffer;
pub use recording::{load_recording, recording_path, ConsoleRecorder, Recording};
