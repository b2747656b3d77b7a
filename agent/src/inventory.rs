//! GPU and shared-device discovery.

use std::path::Path;

use tracing::info;

/// Count the node's GPUs: driver procfs first, then device nodes.
/// `gpu_count` in the config overrides both.
pub fn detect_gpu_count(override_count: Option<usize>) -> usize {
    if let Some(count) = override_count {
        return count;
    }
    if let Ok(entries) = std::fs::read_dir("/proc/driver/nvidia/gpus") {
        let count = entries.count();
        if count > 0 {
            return count;
        }
    }
    let mut count = 0;
    while Path::new(&format!("/dev/nvidia{count}")).exists() {
        count += 1;
    }
    count
}

/// Host devices passed through to every managed container.
pub fn shared_devices() -> Vec<String> {
    let mut devices = Vec::new();
    if Path::new("/dev/infiniband").exists() {
        info!("passing /dev/infiniband through to managed containers");
        devices.push("/dev/infiniband:/dev/infiniband".to_string());
    }
    devices
}
