use gniot_core::service::{Uplink, UplinkError};
use gniot_core::storage::StorageSample;
use log::debug;

/// Uplink for builds without a network transport.
///
/// Every delivery fails, so each measurement ends up in the persistent queue
/// until a transport takes over and replays the backlog.
#[derive(Debug)]
pub struct OfflineUplink {
    node_id: u32,
}

impl OfflineUplink {
    pub const fn new(node_id: u32) -> Self {
        Self { node_id }
    }
}

impl Uplink for OfflineUplink {
    async fn deliver(&mut self, sample: &StorageSample) -> Result<(), UplinkError> {
        debug!(
            "node {}: no transport for sample {}",
            self.node_id, sample.timestamp
        );
        Err(UplinkError::Unreachable {
            details: "no transport linked",
        })
    }

    async fn heartbeat(&mut self) -> Result<(), UplinkError> {
        Err(UplinkError::Unreachable {
            details: "no transport linked",
        })
    }
}
