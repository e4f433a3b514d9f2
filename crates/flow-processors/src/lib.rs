//! Flowdeck step processors
//!
//! Step-level building blocks for running integration flows.
//!
//! This crate provides:
//! - Declarative step model with a closed set of step kinds
//! - Execution context threaded through a run
//! - Processor registry with one processor per step kind
//! - Transport seam to the backend adapter, transformation, condition,
//!   loop and delay services, with an HTTP implementation

pub mod context;
pub mod error;
pub mod processors;
pub mod registry;
pub mod step;
pub mod transport;

pub use context::ExecutionContext;
pub use error::{ErrorRecord, ProcessingError};
pub use processors::create_default_registry;
pub use registry::{ProcessorRegistry, StepProcessor};
pub use step::{Step, StepKind};
pub use transport::{HttpTransport, ServiceKind, ServiceTransport};
