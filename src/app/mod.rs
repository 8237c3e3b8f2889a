//! Command-line application

pub mod cli;
pub mod startup;
