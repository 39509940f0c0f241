pub mod pipeline;

pub use pipeline::{BuildContext, PipelineFactory};
