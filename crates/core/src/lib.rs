// SPDX-License-Identifier: Apache-2.0

//! Process-local layer of the resource manager.
//!
//! A [`SubProcess`] descriptor ties one registered pid to the shared
//! tables: it validates calls against the configured policy, runs the
//! table operations, and executes the returned action lists. Items for
//! the own pid run through the registered callbacks; items for other
//! processes are observed remotely (polling mode) or picked up by the
//! targets' helper threads (async mode).
//!
//! Administrative roles get their own handles: [`drom::DromController`]
//! rewrites process masks at runtime, [`stats::StatsReader`] reads
//! usage statistics. Both attach to existing segments as observers and
//! never register a pid.

pub mod callbacks;
pub mod drom;
pub mod error;
pub mod spd;
pub mod stats;

mod helper;
mod priority;

pub use callbacks::CallbackRegistry;
pub use error::Error;
pub use spd::SubProcess;

pub use dynres_config as config;
pub use dynres_shmem as shmem;
