use rentbox_core::prelude::*;
use rentbox_sandbox::coordinator::Coordinator;

pub struct AppState<E: ContainerEngine, G: GpuProbe> {
    pub coordinator: Coordinator<E, G>,
}

impl<E: ContainerEngine, G: GpuProbe> Clone for AppState<E, G> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
        }
    }
}
