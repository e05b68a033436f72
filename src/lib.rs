pub mod cache;
pub mod condition;
pub mod context;
pub mod engine;
pub mod error;
pub mod evaluated;
pub mod glob;
pub mod project;
pub mod sdk;
pub mod transform;

pub use cache::{ProjectCache, ProjectHandle};
pub use engine::{Engine, GlobInfo, ProjectInstance};
pub use error::EvalError;
pub use evaluated::{EvaluatedItem, EvaluatedTarget, MetadataValue, PropertyInfo};
pub use project::{Project, ProjectElement};
pub use sdk::{DirectorySdkResolver, ImportSearchPath, SdkReference, SdkResolver};
