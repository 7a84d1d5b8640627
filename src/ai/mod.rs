/// Analysis engine, reasoning backends and agent tools
pub mod analyzer;
pub mod backends;
pub mod tools;

pub use analyzer::{AnalysisEngine, AnalysisOutcome, Diagnosis};
pub use backends::{MockBackend, OpenAIBackend, ReasoningBackend, ReasoningRequest};
pub use tools::{CatalogGroupsTool, Tool, ToolRegistry, ToolSpec};
