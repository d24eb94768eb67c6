#![forbid(unsafe_code)]
//! Dataflow pipelines of opaque tasks.
//!
//! Tasks declare named input and output slots and are wired into a [`Graph`]
//! by binding inputs to upstream outputs. A validated [`Pipeline`] can have
//! some of its tasks bypassed with precomputed outputs, and is then driven to
//! completion by an [`Executor`], serially or on a bounded worker pool. Every
//! execution goes through a content-addressed [`Cache`], so identical work is
//! performed at most once.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use nagare::{Action, Executor, Graph, LocalRunner, Outputs, RunConfig, RunDirectory, Task, Value};
//!
//! let mut graph = Graph::new();
//! graph.add_task(
//!     Task::new("greet", Action::function("greet", |inv| {
//!         let name = inv.input("name").and_then(Value::as_text).unwrap_or("world");
//!         Ok(Outputs::from([("greeting".to_string(), Value::text(format!("hello {name}")))]))
//!     }))
//!     .literal("name", "arno")
//!     .output("greeting"),
//! )?;
//!
//! let mut pipeline = graph.validate()?;
//!
//! let dir = tempfile::tempdir()?;
//! let root = camino::Utf8Path::from_path(dir.path()).unwrap();
//! let executor = Executor::new(
//!     RunConfig::default(),
//!     Arc::new(LocalRunner),
//!     Arc::new(RunDirectory::new(root)),
//! )?;
//!
//! let report = executor.run(&mut pipeline)?;
//! assert!(report.is_success());
//! assert_eq!(pipeline.outputs("greet").unwrap()["greeting"], Value::text("hello arno"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod action;
mod bypass;
mod cache;
mod config;
mod core;
mod engine;
mod error;
mod graph;
mod task;
mod utils;
mod workspace;

pub use crate::action::{Action, ActionRunner, Arg, CommandTemplate, Invocation, LocalRunner, STDOUT_LOG};
pub use crate::bypass::BypassDirective;
pub use crate::cache::{Cache, CacheEntry, CacheStore, DiskStore, Fingerprint, MemoryStore, Provenance};
pub use crate::config::{RunConfig, Strategy};
pub use crate::core::{Outputs, Value};
pub use crate::engine::{ExecutionReport, Executor, FailureKind, TaskRecord};
pub use crate::error::*;
pub use crate::graph::{Graph, Pipeline, SlotEdge};
pub use crate::task::{InputSlot, SlotRef, Task, TaskState};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
pub use crate::workspace::{RunDirectory, WorkspaceProvider};
