//! Backend selection for Switchyard
//!
//! - [`Selector`]: group/model resolution, agent and key picking with
//!   exclusion filtering and round-robin or smooth weighted balancing
//! - [`Breaker`]: daily error counters that auto-disable failing agents
//!   and keys
//! - [`Dispatcher`]: the bounded retry loop tying both to an upstream call

#![allow(clippy::missing_errors_doc, clippy::must_use_candidate)]

pub mod balance;
pub mod breaker;
mod dispatch;
mod selector;

pub use balance::{Candidate, RoundRobin, SmoothWeighted};
pub use breaker::{Breakable, Breaker, error_counter_key};
pub use dispatch::{Dispatched, Dispatcher, Route, UpstreamError};
pub use selector::{Picked, Selector};
