use std::path::Path;
use std::sync::atomic::Ordering;

use serde_json::json;
use tracing::info;

use super::QemuContext;
use crate::errors::DriverError;
use crate::qmp::QmpCommand;

impl QemuContext {
    /// `stop` or `cont` the guest.
    pub async fn pause(&self, pause: bool) -> Result<(), DriverError> {
        let command = if pause { "stop" } else { "cont" };
        self.execute(vec![QmpCommand::new(command)]).await
    }

    /// Hot-add vCPUs up to `cpus`. The count never goes down.
    pub async fn set_cpus(&self, cpus: u32) -> Result<(), DriverError> {
        let current = self.cpus.load(Ordering::SeqCst);
        if cpus < current {
            return Err(DriverError::InvalidCpuCount {
                current,
                requested: cpus,
            });
        }
        if cpus == current {
            return Ok(());
        }

        let commands = (current..cpus)
            .map(|id| QmpCommand::with_arguments("cpu-add", json!({ "id": id })))
            .collect();
        let counter = self.cpus.clone();
        // Overlapping calls may finish out of order; the count only grows
        self.execute_then(commands, move |result| {
            if result.is_ok() {
                counter.fetch_max(cpus, Ordering::SeqCst);
            }
        })
        .await?;

        info!(vm_id = %self.vm_id(), from = current, to = cpus, "vcpus added");
        Ok(())
    }

    /// Hot-add a `size_mb` DIMM in memory slot `slot`.
    pub async fn add_mem(&self, slot: u32, size_mb: u64) -> Result<(), DriverError> {
        let size = size_mb
            .checked_mul(1 << 20)
            .ok_or(DriverError::InvalidMemorySize { size_mb })?;
        let backend = format!("mem{}", slot);
        let commands = vec![
            QmpCommand::with_arguments(
                "object-add",
                json!({
                    "qom-type": "memory-backend-ram",
                    "id": backend,
                    "props": { "size": size },
                }),
            ),
            QmpCommand::with_arguments(
                "device_add",
                json!({
                    "driver": "pc-dimm",
                    "id": format!("dimm{}", slot),
                    "memdev": backend,
                }),
            ),
        ];
        self.execute(commands).await?;

        info!(vm_id = %self.vm_id(), slot, size_mb, "memory added");
        Ok(())
    }

    /// Migrate the VM state into `path`. Template VMs skip shared memory.
    ///
    /// Returns when QEMU accepted the migration; completion is not polled.
    pub async fn save(&self, path: &Path) -> Result<(), DriverError> {
        let mut commands = Vec::with_capacity(2);
        if self.sandbox.boot.boot_to_be_template {
            commands.push(QmpCommand::with_arguments(
                "migrate-set-capabilities",
                json!({
                    "capabilities": [
                        { "capability": "bypass-shared-memory", "state": true }
                    ]
                }),
            ));
        }
        commands.push(QmpCommand::with_arguments(
            "migrate",
            json!({ "uri": format!("exec:cat>{}", path.display()) }),
        ));
        self.execute(commands).await?;

        info!(vm_id = %self.vm_id(), path = %path.display(), "vm state saved");
        Ok(())
    }
}
