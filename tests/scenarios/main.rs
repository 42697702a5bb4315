//! Scenario-based tests for ci-graph

mod helpers;

mod cancellation;
mod failure_handling;
mod graph_resolution;
mod parameter_flow;
mod pipeline_from_config;
