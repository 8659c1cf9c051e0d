use tracing::debug;

use crate::error::StoreResult;
use crate::traits::{AttachId, BlockDevice, ReadRequest};

/// Batches reads against one device and submits them together.
///
/// Requests that continue the previous one in both the target and on the
/// device are merged, so streaming a fragmented object produces one
/// request per device run.
pub struct ReadTxn<'a> {
    device: &'a dyn BlockDevice,
    requests: Vec<ReadRequest>,
}

impl<'a> ReadTxn<'a> {
    pub fn new(device: &'a dyn BlockDevice) -> Self {
        Self {
            device,
            requests: Vec::new(),
        }
    }

    /// Queue a read of `block_count` device blocks starting at
    /// `device_block` into `target_block` of attachment `attach`.
    pub fn enqueue(&mut self, attach: AttachId, target_block: u64, device_block: u64, block_count: u64) {
        if block_count == 0 {
            return;
        }
        let request = ReadRequest {
            attach,
            target_block,
            device_block,
            block_count,
        };
        if let Some(last) = self.requests.last_mut() {
            if last.is_followed_by(&request) {
                last.block_count += block_count;
                return;
            }
        }
        self.requests.push(request);
    }

    /// Requests queued so far.
    pub fn pending(&self) -> &[ReadRequest] {
        &self.requests
    }

    /// Submit every queued request and wait for completion.
    pub fn transact(&mut self) -> StoreResult<()> {
        if self.requests.is_empty() {
            return Ok(());
        }
        let requests = std::mem::take(&mut self.requests);
        debug!(requests = requests.len(), "submitting read transaction");
        self.device.submit(&requests)
    }
}
