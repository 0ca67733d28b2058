//! Command-line client

pub mod options;
pub mod run;
