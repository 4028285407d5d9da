pub mod llm;
pub mod normalize;
pub mod pipeline;
pub mod setup;
pub mod stages;
