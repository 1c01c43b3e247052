pub mod preview;

pub use preview::{ChannelSink, FrameSink, LatestFramePreview, PreviewFrame};
