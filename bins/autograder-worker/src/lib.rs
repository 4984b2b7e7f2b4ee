//! Autograder worker: fetches pending submissions, runs them in a sandbox
//! against the assignment's tests, and pushes scores back.

pub mod config;
pub mod docker;
pub mod engine;
pub mod evaluator;
pub mod executor;
pub mod harness;
pub mod runner;
pub mod spec;

#[cfg(test)]
mod engine_tests;
