//! # Task
//!
//! Runs a scan on a dedicated thread so the host's loader never waits on it.
//!
//! The returned [`PatchTask`] can be joined for the report or simply dropped, which detaches the worker.
//! There is no cancellation: if the host unloads the module while the worker is still scanning, behavior is undefined.

use std::fmt::Display;
use std::io;
use std::thread::{self, JoinHandle};

use log::{error, info};
use thiserror::Error;

use crate::host::{HostResolver, ResolveError};
use crate::orchestrator::{Orchestrator, RunConfig, RunError, RunReport};
use crate::patcher::Patcher;

/// Name of the worker thread
pub const THREAD_NAME: &str = "aobpatch-scan";

/// Errors from a scan task
#[derive(Debug, Error)]
pub enum TaskError {
    /// The worker thread could not be started
    #[error("failed to spawn the scan thread: {0}")]
    Spawn(#[from] io::Error),
    /// The worker thread panicked
    #[error("scan thread panicked")]
    Panicked,
    /// The host image could not be located
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// The run was rejected
    #[error(transparent)]
    Run(#[from] RunError),
}

/// Handle to a running scan
pub struct PatchTask {
    /// Worker thread
    handle: JoinHandle<Result<RunReport, TaskError>>,
}

impl PatchTask {
    /// Whether the worker has finished
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Blocks until the worker finishes and returns its report
    pub fn wait(self) -> Result<RunReport, TaskError> {
        self.handle.join().map_err(|_| TaskError::Panicked)?
    }
}

/// Resolves the host image and runs `orchestrator` over it on a new thread
///
/// # Safety
///
/// The image `resolver` returns must stay mapped until the worker finishes,
/// and the patcher must be able to write to it.
pub unsafe fn spawn<R, P>(
    resolver: R,
    orchestrator: Orchestrator<'static, P>,
) -> Result<PatchTask, TaskError>
where
    R: HostResolver + Send + 'static,
    P: Patcher + Send + 'static,
    P::Error: Display,
{
    let handle = thread::Builder::new()
        .name(THREAD_NAME.to_owned())
        .spawn(move || {
            let result = resolve_and_run(&resolver, &orchestrator);
            if let Err(e) = &result {
                error!("Scan failed: {}", e);
            }
            result
        })?;
    Ok(PatchTask { handle })
}

/// Body of the worker thread
fn resolve_and_run<R, P>(
    resolver: &R,
    orchestrator: &Orchestrator<'static, P>,
) -> Result<RunReport, TaskError>
where
    R: HostResolver,
    P: Patcher,
    P::Error: Display,
{
    let module = resolver.resolve()?;
    // Safety: `spawn`'s caller guarantees the resolved image stays mapped and writable
    let report = unsafe { orchestrator.run(&module, module.view()) }?;
    Ok(report)
}

/// Entry point for hosts: logs, spawns the scan over the shipped variants, and returns without waiting
///
/// # Safety
///
/// See [`spawn`].
pub unsafe fn launch<R, P>(
    resolver: R,
    patcher: P,
    config: RunConfig,
) -> Result<PatchTask, TaskError>
where
    R: HostResolver + Send + 'static,
    P: Patcher + Send + 'static,
    P::Error: Display,
{
    info!("{} initializing.", config.mode);
    let task = spawn(resolver, Orchestrator::new(patcher, config))?;
    info!("Scan thread spawned.");
    Ok(task)
}
