//! Execution Engine Abstraction Layer
//!
//! Provides a uniform contract over the embedded and distributed engines, with
//! routing and fallback between them.

pub mod distributed_engine;
pub mod embedded_engine;
pub mod engine;
pub mod result;
pub mod router;
pub mod validation;

pub use distributed_engine::DistributedEngine;
pub use embedded_engine::EmbeddedEngine;
pub use engine::{EngineAdapter, EngineCapabilities, EngineError, EngineKind, TableColumn};
pub use result::{ResultColumn, ResultEnvelope};
pub use router::{QueryRouter, RouteFailure};
pub use validation::{validate_sql, ValidationReport};
