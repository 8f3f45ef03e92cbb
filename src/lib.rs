//! # dissec-sim - DISSEC Secure Aggregation Simulator
//!
//! A discrete-event simulator of a tree-structured secure aggregation
//! protocol. Contributors split a private value into additive shares, one per
//! member of their parent group; groups of aggregators sum the shares and
//! forward partial aggregates up to a single querier, which recovers the sum
//! of all contributions without any aggregator seeing an individual value.
//!
//! ## Core Components
//!
//! - **GroupTree**: indexed table of groups, shared by every node
//! - **Node**: protocol agent, one handler per message type
//! - **Manager**: event loop with the message queue, failure sampling and
//!   failure notices
//! - **ExperimentRunner**: builds runs from configurations and collects
//!   their results
//!
//! ## Building blocks
//!
//! Robustness is tuned by four independent blocks, see [`BuildingBlocks`]:
//!
//! | Strategy    | Propagation | Handling | Standby  | Synchronization |
//! |-------------|-------------|----------|----------|-----------------|
//! | Eager       | Full        | Drop     | Stop     | None            |
//! | Optimistic  | Local       | Replace  | Continue | NonBlocking     |
//! | Pessimistic | Full        | Replace  | Stop     | Full            |
//! | LeavesSync  | Local       | Replace  | Continue | Leaves          |
//! | Strawman    | Full        | Replace  | Stop     | None            |
//! | Degraded    | Local       | Drop     | Continue | NonBlocking     |
//!
//! ```no_run
//! use dissec_sim::{ExperimentRunner, RunConfig};
//!
//! let config = RunConfig::default().with_strategy("Optimistic").unwrap();
//! let result = ExperimentRunner::new().single_run(&config).unwrap();
//! result.print_summary();
//! ```
//!
//! Experiment files and the command line runners live in `simulator/`.

// Model
pub mod ds_config;
pub mod ds_error;
pub mod ds_interface;
pub mod ds_random;
pub mod ds_tree;

// Protocol
mod ds_aggregation;
pub mod ds_backups;
mod ds_contribution;
pub mod ds_node;
mod ds_recovery;

// Simulation
pub mod ds_experiment;
pub mod ds_export;
pub mod ds_manager;
pub mod ds_metrics;
pub mod ds_queue;
pub mod ds_runner;

pub use ds_config::{create_run_configs, strategy, BuildingBlocks, ExperimentSweep, RunConfig};
pub use ds_error::SimError;
pub use ds_experiment::ExperimentFile;
pub use ds_interface::{Aggregate, Message, MessageContent, NodeId, NodeRole, StopStatus};
pub use ds_manager::Manager;
pub use ds_metrics::RunResult;
pub use ds_node::Node;
pub use ds_runner::ExperimentRunner;
pub use ds_tree::GroupTree;
