//! Chartpack CLI - offline chart and image bundles.

pub mod commands;
pub mod output;
