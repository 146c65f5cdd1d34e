#![forbid(unsafe_code)]

pub mod demo;
pub mod workbench_cli;
