// SPDX-License-Identifier: Apache-2.0

//! Error type of the process-local layer.

use dynres_config::error::ConfigError;
use dynres_shmem::{OpError, ResourceError, ShmemError};

/// Errors surfaced by sub-process and administrative operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The descriptor was finalized (or never initialized).
    #[error("resource manager is not initialized")]
    NotInitialized,

    /// The operation requires a policy or feature this descriptor was
    /// not configured with.
    #[error("functionality is disabled by configuration: {0}")]
    Disabled(&'static str),

    /// A synchronous mask update was not adopted in time.
    #[error("process {0} did not adopt the mask update in time")]
    PollTimeout(dynres_shmem::ProcessId),

    /// The shared tables refused the request.
    #[error(transparent)]
    Refused(ResourceError),

    /// The shared-memory plumbing failed.
    #[error(transparent)]
    Shmem(ShmemError),

    /// Options could not be resolved.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The helper thread could not be spawned.
    #[error("failed to spawn helper thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}

impl From<OpError> for Error {
    fn from(e: OpError) -> Self {
        match e {
            OpError::Refused(r) => Error::Refused(r),
            OpError::Shmem(s) => Error::Shmem(s),
        }
    }
}

impl From<ResourceError> for Error {
    fn from(e: ResourceError) -> Self {
        Error::Refused(e)
    }
}

impl From<ShmemError> for Error {
    fn from(e: ShmemError) -> Self {
        Error::Shmem(e)
    }
}
