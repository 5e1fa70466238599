//! Format Tool & Control Surface (§4.9, ambient). Generalizes the sysfs partition attributes
//! from `ouichefs_interface.c` (`create`/`destroy`/`restore`/`list`) as plain methods over a
//! mounted `Volume`, so any future sysfs/ioctl/CLI front-end is a thin adapter rather than part
//! of the core.

use std::sync::Arc;

use crate::error::Result;
use crate::snapshot::{format_snapshot_line, SnapshotInfo};
use crate::volume::Volume;

pub struct SnapshotControl {
    volume: Arc<Volume>,
}

impl SnapshotControl {
    pub fn new(volume: Arc<Volume>) -> Self {
        Self { volume }
    }

    /// `create_store`: create a new snapshot, returning its assigned id.
    pub fn create(&self) -> Result<u32> {
        let id = self.volume.snapshot_create(0)?;
        log::info!("snapshot control: created snapshot {}", id);
        Ok(id)
    }

    /// `destroy_store`.
    pub fn destroy(&self, id: u32) -> Result<()> {
        self.volume.snapshot_delete(id)?;
        log::info!("snapshot control: destroyed snapshot {}", id);
        Ok(())
    }

    /// `restore_store`.
    pub fn restore(&self, id: u32) -> Result<()> {
        self.volume.snapshot_restore(id)?;
        log::info!("snapshot control: restored snapshot {}", id);
        Ok(())
    }

    /// `list_show`: one formatted line per named snapshot.
    pub fn list(&self) -> Vec<SnapshotInfo> {
        self.volume.snapshot_list()
    }

    /// `list_show`, rendered the way the sysfs attribute renders it.
    pub fn list_text(&self) -> String {
        self.list().iter().map(format_snapshot_line).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::mount_test_volume;

    #[test]
    fn create_list_destroy_roundtrip() {
        let volume = Arc::new(mount_test_volume(512));
        let control = SnapshotControl::new(volume);

        let id = control.create().unwrap();
        assert_eq!(control.list().len(), 1);
        assert!(control.list_text().contains(&format!("{}:", id)));
        control.destroy(id).unwrap();
        assert!(control.list().is_empty());
    }
}
