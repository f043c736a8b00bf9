use crate::engine::*;
use crate::error::*;

use futures::stream::BoxStream;

/// A trait for injecting the container engine into the sandbox.
///
/// Implementations must treat every id/tag argument as opaque and report
/// missing resources as [`EngineError::NotFound`] so the reaper can stay idempotent.
pub trait ContainerEngine: Send + Sync + 'static + Clone {
    /// Checks that the engine is reachable.
    fn ping(&self) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn image_exists(&self, tag: &str) -> impl Future<Output = Result<bool, EngineError>> + Send;

    /// Builds the `Dockerfile` in `ctx.dir` and tags the result with `ctx.tag`.
    fn build_image(&self, ctx: BuildContext)
    -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Creates (but does not start) a container. Returns the engine's container id.
    fn create_container(
        &self,
        spec: ContainerSpec,
    ) -> impl Future<Output = Result<String, EngineError>> + Send;

    fn start_container(&self, id: &str) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Follows stdout and stderr from the start until the container exits.
    fn logs(&self, id: &str) -> BoxStream<'static, Result<LogChunk, EngineError>>;

    /// Resolves once the container is no longer running.
    fn wait_container(&self, id: &str)
    -> impl Future<Output = Result<ExitStatus, EngineError>> + Send;

    /// Sends SIGKILL to the container's init process and with it the whole process tree.
    fn kill_container(&self, id: &str) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// A single stats reading. [`None`] when the engine has none for the container's state.
    fn stats(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<StatsSample>, EngineError>> + Send;

    /// Force-removes a container, running or not.
    fn remove_container(&self, id: &str) -> impl Future<Output = Result<(), EngineError>> + Send;

    fn remove_image(&self, tag: &str) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Containers (in any state) carrying `label`.
    fn list_containers(
        &self,
        label: &str,
    ) -> impl Future<Output = Result<Vec<ManagedResource>, EngineError>> + Send;

    /// Tagged images carrying `label`.
    fn list_images(
        &self,
        label: &str,
    ) -> impl Future<Output = Result<Vec<ManagedResource>, EngineError>> + Send;
}

/// A trait for reading GPU utilization on the lender's host.
pub trait GpuProbe: Send + Sync + 'static + Clone {
    /// Utilization in percent, [`None`] when unknown.
    fn utilization(&self) -> impl Future<Output = Option<f64>> + Send;
}

/// Reports no GPU. Used when the host has no GPU monitoring.
#[derive(Clone, Debug, Default)]
pub struct NoGpuProbe;

impl GpuProbe for NoGpuProbe {
    async fn utilization(&self) -> Option<f64> {
        None
    }
}
