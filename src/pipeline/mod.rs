pub mod camera;
pub mod channel;
pub mod process;
pub mod producer;
pub mod recognizer;

// Re-exports for convenience
pub use camera::{CaptureBackend, FrameSource, SyntheticSource};
pub use channel::{SampleReceiver, SampleSender, SampleSink, sample_channel};
pub use process::{LineSink, ProducerProcess, run_child_producer};
pub use producer::{
    ProducerExit, ProducerSummary, ProducerThread, run_producer, spawn_producer_thread,
};
pub use recognizer::{EngineBackend, FaceEngine, PlaceholderEngine};
