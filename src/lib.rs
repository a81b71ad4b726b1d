//! # Station DAQ Core Library
//!
//! This crate is the core library for the `station-daq` collector. It polls the
//! instruments of an unattended measurement station, bins their readings into
//! reporting-interval files, stages those files atomically and ships them to a
//! remote archive over SFTP. The binary in `main.rs` is a thin CLI over
//! [`app::StationApp`].
//!
//! ## Crate Structure
//!
//! - **`adapters`**: one `ProtocolAdapter` variant per protocol family
//!   (serial text, socket text, binary register, passive filesystem).
//! - **`worker`**: the per-instrument task that owns an adapter and runs the
//!   connect, configure and poll state machine.
//! - **`buffer`**: shared per-instrument record buffer and harvest queue.
//! - **`scheduler`**: wall-clock aligned triggers that skip, never queue, and
//!   the staging job each instrument runs on its own trigger.
//! - **`stager`**: rendering and atomic (optionally zipped) writes into staging.
//! - **`transfer`**: the upload engine with its in-flight ledger and the SFTP
//!   connector.
//! - **`config`**: loading and validating the station TOML with `figment`.
//! - **`error`**: the crate-wide `DaqError`.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`core`**, **`timebin`**, **`clock`**, **`retry`**: records, interval
//!   arithmetic, wall-clock sources and backoff.

pub mod adapters;
pub mod app;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod retry;
pub mod scheduler;
pub mod stager;
pub mod timebin;
pub mod transfer;
pub mod worker;

pub use error::{AppResult, DaqError};
