use crate::engine::StatsSample;
use crate::job::ResourceUsage;

/// CPU usage between two samples, as `cpu_delta / system_delta * online_cpus * 100`.
///
/// Always within `0..=online_cpus * 100`. A missing `pre` sample, a non-positive
/// delta or a missing counter yields 0.
pub fn cpu_percent(pre: Option<&StatsSample>, post: &StatsSample) -> f64 {
    let Some(pre) = pre else {
        return 0.0;
    };

    let (Some(cpu_pre), Some(cpu_post)) = (pre.cpu_total_usage, post.cpu_total_usage) else {
        return 0.0;
    };
    let (Some(sys_pre), Some(sys_post)) = (pre.system_cpu_usage, post.system_cpu_usage) else {
        return 0.0;
    };

    let cpu_delta = cpu_post as i128 - cpu_pre as i128;
    let system_delta = sys_post as i128 - sys_pre as i128;
    if cpu_delta <= 0 || system_delta <= 0 {
        return 0.0;
    }

    let online = post.online_cpus.or(pre.online_cpus).unwrap_or(1).max(1) as f64;
    let percent = (cpu_delta as f64 / system_delta as f64) * online * 100.0;

    if percent.is_finite() {
        percent.clamp(0.0, online * 100.0)
    } else {
        0.0
    }
}

impl ResourceUsage {
    /// Builds a usage report from the first and the latest valid sample of a run.
    pub fn from_samples(
        first: Option<&StatsSample>,
        latest: Option<&StatsSample>,
        gpu_utilization_percent: Option<f64>,
    ) -> Self {
        let cpu_percent = latest.map(|post| cpu_percent(first, post)).unwrap_or(0.0);
        let memory_bytes = latest.and_then(|s| s.memory_usage).unwrap_or(0);
        let gpu_utilization_percent = gpu_utilization_percent
            .filter(|v| v.is_finite())
            .map(|v| v.clamp(0.0, 100.0))
            .unwrap_or(0.0);

        Self {
            cpu_percent,
            memory_bytes,
            gpu_utilization_percent,
        }
    }
}
