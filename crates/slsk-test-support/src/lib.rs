#![forbid(unsafe_code)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic)]

//! Shared test helpers used across integration suites.
//! Layout: fakes.rs (recording collaborators), fixtures.rs (scratch config and shared files).

pub mod fakes;
pub mod fixtures;
