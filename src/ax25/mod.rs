//! AX.25 frame validation

mod crc;
pub mod frame;

pub use crc::{append_fcs, check_fcs, crc16_x25, CRC_INCLUSIVE_CONSTANT};
pub use frame::{encode_ui_frame, is_valid_frame, Address, FrameError, FrameView};

/// Two addresses, control byte and FCS
pub const MIN_FRAME_LEN: usize = 17;

/// Ten addresses, control, PID, 256 info bytes and FCS
pub const MAX_FRAME_LEN: usize = 330;
