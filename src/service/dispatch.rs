//! Frame validation and delivery

use tracing::{debug, trace};

use super::state::ServiceShared;
use crate::ax25;
use crate::buffer::{FrameBuffer, FrameStatus};
use crate::decoder::FrameSink;
use crate::diag::EventFlags;

/// Structure check then CRC over the whole frame
pub fn classify(data: &[u8]) -> FrameStatus {
    if !ax25::is_valid_frame(data) {
        return FrameStatus::INVALID_FRAME;
    }
    if ax25::check_fcs(data) {
        FrameStatus::FRAME_RDY
    } else {
        FrameStatus::CRC_ERROR
    }
}

impl ServiceShared {
    /// Validate a completed frame, count it and hand it to the consumer
    pub(crate) fn dispatch(&self, mut frame: FrameBuffer) -> FrameStatus {
        let status = classify(frame.data());
        let callback = {
            let mut core = self.lock();
            core.stats.frames += 1;
            if !status.contains(FrameStatus::INVALID_FRAME) {
                core.stats.valid += 1;
            }
            if status.contains(FrameStatus::FRAME_RDY) {
                core.stats.good += 1;
            }
            core.callback.clone()
        };
        frame.set_status(status);

        if status.contains(FrameStatus::CRC_ERROR) {
            self.events.raise(EventFlags::PKT_CRC_ERROR);
        }
        if status.contains(FrameStatus::INVALID_FRAME) {
            self.events.raise(EventFlags::PKT_INVALID_FRAME);
        }
        debug!("Radio {} frame {} bytes: {:?}", self.radio, frame.len(), status);

        match callback {
            None => self.deliver_to_queue(frame),
            Some(callback) => {
                frame.set_callback(Some(callback));
                self.spawn_callback(frame);
            }
        }
        status
    }
}

impl FrameSink for ServiceShared {
    fn record_sync(&self) {
        self.lock().stats.sync += 1;
        trace!("Radio {} frame sync", self.radio);
    }

    fn deliver(&self, frame: FrameBuffer) -> FrameStatus {
        self.dispatch(frame)
    }
}
