//! Packed pulse records
//!
//! Each record is three bytes holding two 12-bit fields: the mark (pulse
//! width) and the space (period minus width), both in capture ticks. A
//! record with a zero mark can never be real data, so it carries an
//! in-band control code in the space field instead.

/// Largest value a 12-bit field can hold
pub const PULSE_FIELD_MAX: u16 = 0x0FFF;

/// In-band control codes written into the pulse stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StreamCode {
    /// CCA dropped, normal end of stream
    CcaClose = 0x01,
    /// Reception was stopped
    DecodeStop = 0x02,
    /// No segment available to extend the chain
    QueueFull = 0x03,
    /// CCA raised but no pulses followed
    NoData = 0x04,
    /// Capture returned a zero width
    ZeroWidth = 0x05,
    /// Capture counter overflowed
    IcuOverflow = 0x06,
    /// A previous stream was still open
    Remnant = 0x07,
    /// Decoder finished the frame before the stream ended
    AckDecodeEnd = 0x08,
    /// Decoder reset the stream
    AckDecodeError = 0x09,
    /// Reading continues in the next linked segment
    BufferSwap = 0x0A,
}

impl StreamCode {
    pub fn from_raw(raw: u16) -> Option<Self> {
        Some(match raw {
            0x01 => Self::CcaClose,
            0x02 => Self::DecodeStop,
            0x03 => Self::QueueFull,
            0x04 => Self::NoData,
            0x05 => Self::ZeroWidth,
            0x06 => Self::IcuOverflow,
            0x07 => Self::Remnant,
            0x08 => Self::AckDecodeEnd,
            0x09 => Self::AckDecodeError,
            0x0A => Self::BufferSwap,
            _ => return None,
        })
    }

    /// Every code except a buffer swap ends the stream
    pub fn is_terminal(self) -> bool {
        self != Self::BufferSwap
    }
}

/// One pulse as seen by the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    pub mark: u16,
    pub space: u16,
}

/// Decoded view of a packed record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseRecord {
    Pulse(Pulse),
    InBand(StreamCode),
    /// In-band prefix with an unknown code
    Invalid(u16),
}

/// Three byte packed pulse record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedPulse([u8; 3]);

impl PackedPulse {
    /// Pack a captured width and period. Fields saturate at 12 bits.
    ///
    /// A zero width would be read back as in-band; callers reject it first.
    pub fn data(width: u16, period: u16) -> Self {
        let mark = width.min(PULSE_FIELD_MAX);
        let space = period.saturating_sub(width).min(PULSE_FIELD_MAX);
        Self::pack(mark, space)
    }

    pub fn in_band(code: StreamCode) -> Self {
        Self::pack(0, code as u16)
    }

    fn pack(mark: u16, space: u16) -> Self {
        Self([
            (mark & 0xFF) as u8,
            ((mark >> 8) as u8 & 0x0F) | (((space & 0x0F) as u8) << 4),
            (space >> 4) as u8,
        ])
    }

    pub fn mark(self) -> u16 {
        self.0[0] as u16 | (((self.0[1] & 0x0F) as u16) << 8)
    }

    pub fn space(self) -> u16 {
        ((self.0[1] >> 4) as u16) | ((self.0[2] as u16) << 4)
    }

    pub fn bytes(self) -> [u8; 3] {
        self.0
    }

    pub fn record(self) -> PulseRecord {
        match self.mark() {
            0 => match StreamCode::from_raw(self.space()) {
                Some(code) => PulseRecord::InBand(code),
                None => PulseRecord::Invalid(self.space()),
            },
            mark => PulseRecord::Pulse(Pulse {
                mark,
                space: self.space(),
            }),
        }
    }
}
