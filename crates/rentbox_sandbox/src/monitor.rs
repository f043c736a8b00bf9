use rentbox_core::prelude::*;

use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Upper bound for one GPU reading.
const GPU_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Read-only access to container stats and host GPU utilization.
#[derive(Clone)]
pub struct ResourceMonitor<E: ContainerEngine, G: GpuProbe> {
    engine: E,
    gpu: G,
}

impl<E: ContainerEngine, G: GpuProbe> ResourceMonitor<E, G> {
    pub fn new(engine: E, gpu: G) -> Self {
        Self { engine, gpu }
    }

    /// One stats reading. Errors and missing stats (e.g. the container is gone) yield [`None`].
    pub async fn sample(&self, container_id: &str) -> Option<StatsSample> {
        match self.engine.stats(container_id).await {
            Ok(sample) => sample,
            Err(e) => {
                debug!(container = %container_id, "stats unavailable: {e}");
                None
            }
        }
    }

    /// Host GPU utilization. A reading slower than [`GPU_READ_TIMEOUT`] counts as unknown.
    pub async fn gpu_utilization(&self) -> Option<f64> {
        match tokio::time::timeout(GPU_READ_TIMEOUT, self.gpu.utilization()).await {
            Ok(utilization) => utilization,
            Err(_) => {
                debug!("gpu reading timed out");
                None
            }
        }
    }

    /// Takes a container and a GPU reading and feeds both into `tracker`.
    pub async fn record(&self, container_id: &str, tracker: &mut UsageTracker) {
        if let Some(sample) = self.sample(container_id).await {
            tracker.record(sample);
        }
        if let Some(gpu) = self.gpu_utilization().await {
            tracker.record_gpu(gpu);
        }
    }
}

impl<E: ContainerEngine, G: GpuProbe> ResourceMonitor<E, G> {
    /// Samples `container_id` every `interval` on its own task until [`Sampler::finish`].
    pub fn spawn_sampler(&self, container_id: &str, interval: Duration) -> Sampler {
        let (stop, mut stopped) = oneshot::channel::<()>();
        let monitor = self.clone();
        let container_id = container_id.to_string();

        let handle = tokio::spawn(async move {
            let mut tracker = UsageTracker::default();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    // Also fires when the sender is dropped.
                    _ = &mut stopped => break,
                    _ = async {
                        ticker.tick().await;
                        monitor.record(&container_id, &mut tracker).await;
                    } => {}
                }
            }
            tracker
        });

        Sampler { stop, handle }
    }
}

/// A running sampling task. Dropping it stops sampling.
pub struct Sampler {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<UsageTracker>,
}

impl Sampler {
    /// Stops sampling, abandoning a reading in flight, and returns what was recorded.
    pub async fn finish(self) -> UsageTracker {
        let _ = self.stop.send(());
        match self.handle.await {
            Ok(tracker) => tracker,
            Err(e) => {
                warn!("sampling task failed: {e}");
                UsageTracker::default()
            }
        }
    }
}

/// The samples of one run, reduced to what the usage report needs.
#[derive(Debug, Clone, Default)]
pub struct UsageTracker {
    first_cpu: Option<StatsSample>,
    latest_cpu: Option<StatsSample>,
    latest_memory: Option<u64>,
    latest_gpu: Option<f64>,
    samples: usize,
}

impl UsageTracker {
    pub fn record(&mut self, sample: StatsSample) {
        self.samples += 1;

        if sample.has_cpu() {
            if self.first_cpu.is_none() {
                self.first_cpu = Some(sample);
            } else {
                self.latest_cpu = Some(sample);
            }
        }

        // Stopped containers report zero memory; keep the last real reading.
        if let Some(memory) = sample.memory_usage.filter(|m| *m > 0) {
            self.latest_memory = Some(memory);
        }
    }

    pub fn record_gpu(&mut self, utilization: f64) {
        self.latest_gpu = Some(utilization);
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// CPU between the first and latest counters, memory and GPU at the latest reading.
    pub fn usage(&self) -> ResourceUsage {
        let latest = StatsSample {
            memory_usage: self.latest_memory,
            ..self.latest_cpu.unwrap_or_default()
        };
        ResourceUsage::from_samples(self.first_cpu.as_ref(), Some(&latest), self.latest_gpu)
    }
}
