pub mod context;
pub mod embedding;
pub mod jobs;
pub mod live;
pub mod llm;
pub mod model;
pub mod prompt;
pub mod rollforward;
pub mod store;
