// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task graph and parallel executor.
//!
//! - [`types`] - task records and statuses
//! - [`dag`] - the dependency graph: ready set, cycles, topological order
//! - [`executor`] - drives the graph with worker agents under a parallelism
//!   bound

pub mod dag;
pub mod executor;
pub mod types;

pub use dag::Dag;
pub use executor::{ExecutionEvent, ExecutionEventKind, Executor};
pub use types::{Task, TaskStatus};
