//! Grid arithmetic and strategy
//!
//! `solver` turns quote-currency cost targets into legal base amounts,
//! `planner` lays out the price ladder for both grid kinds, and `strategy`
//! drives placement and fill handling against the gateway and the store.

pub mod planner;
pub mod solver;
pub mod strategy;

pub use planner::{plan_flat, plan_range, Ladder, PlannedOrder};
pub use solver::amount_for_cost;
pub use strategy::{FillOutcome, GridStrategy, PlacementSummary};
