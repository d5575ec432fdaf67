pub mod action;
pub mod actionrun;
pub mod command_context;
pub mod config;
pub mod error;
pub mod eventloop;
pub mod io;
pub mod job;
pub mod jobrun;
pub mod mcp;
pub mod node;
pub mod observer;
pub mod runtime;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod timeutils;

#[cfg(test)]
mod testing;

pub use config::{ConfigWarning, MasterConfig, WarnLevel};
pub use error::{Result, TronError};
pub use job::{Job, JobStatus};
pub use jobrun::JobRunState;
pub use mcp::MasterControlProgram;
pub use node::{LocalNode, Node, NodePool, NodePoolStore};
pub use service::{ServiceStatus, ServiceInstance};
