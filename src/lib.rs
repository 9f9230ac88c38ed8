//! Nonlinear continuation and time integration for coupled device/circuit
//! simulation.
//!
//! A distributed device problem and a lumped circuit engine are solved as
//! one nonlinear system. The controllers in [`analysis`] reach a DC
//! operating point by source ramping, trace DC transfer curves with
//! bisection backoff, and integrate transients with adaptive BDF steps.

pub mod analysis;
pub mod circuit;
pub mod config;
pub mod context;
pub mod coupling;
pub mod device;
pub mod error;
pub mod history;
pub mod ir;
pub mod output;
pub mod parser;
pub mod simulation;
pub mod solver;
pub mod sparse;
pub mod stats;
