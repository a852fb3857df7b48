//! Utility functions for the preview proxy

pub mod http;
pub mod url;
