//! Capture bench: command line front end for the acquisition pipeline.

pub mod args;
pub mod run;
