//! callcentre - load tester for a Shaken Fist control plane
//!
//! Launches a batch of instances into a throwaway namespace, waits for each
//! one to phone home over HTTP, and tears everything down again.

pub mod callback;
pub mod config;
pub mod orchestrator;
pub mod retry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
