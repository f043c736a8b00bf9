use rentbox_core::traits::GpuProbe;

use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Reads GPU utilization from `nvidia-smi`, averaged over all devices.
#[derive(Clone, Debug)]
pub struct NvidiaSmiProbe {
    binary: String,
    timeout: Duration,
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self {
            binary: "nvidia-smi".to_string(),
            timeout: Duration::from_secs(2),
        }
    }
}

impl NvidiaSmiProbe {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            ..Default::default()
        }
    }
}

impl GpuProbe for NvidiaSmiProbe {
    async fn utilization(&self) -> Option<f64> {
        let output = Command::new(&self.binary)
            .args(["--query-gpu=utilization.gpu", "--format=csv,noheader,nounits"])
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(out)) if out.status.success() => {
                parse_utilization(&String::from_utf8_lossy(&out.stdout))
            }
            Ok(Ok(out)) => {
                debug!(status = %out.status, "nvidia-smi failed");
                None
            }
            Ok(Err(e)) => {
                debug!("nvidia-smi unavailable: {e}");
                None
            }
            Err(_) => {
                debug!("nvidia-smi timed out");
                None
            }
        }
    }
}

fn parse_utilization(stdout: &str) -> Option<f64> {
    let readings: Vec<f64> = stdout
        .lines()
        .filter_map(|line| line.trim().parse::<f64>().ok())
        .collect();

    if readings.is_empty() {
        return None;
    }
    Some(readings.iter().sum::<f64>() / readings.len() as f64)
}
