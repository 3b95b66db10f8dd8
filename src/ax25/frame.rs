//! AX.25 frame structure

use std::fmt;

use super::{MAX_FRAME_LEN, MIN_FRAME_LEN};

/// Encoded length of one address field
pub const ADDRESS_LEN: usize = 7;

/// Destination, source and up to eight digipeaters
pub const MAX_ADDRESSES: usize = 10;

/// Control field of an unnumbered information frame
pub const CONTROL_UI: u8 = 0x03;

/// Protocol identifier for no layer 3
pub const PID_NO_LAYER3: u8 = 0xF0;

/// Frame structure error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    InvalidLength,
    AddressUnterminated,
    TooFewAddresses,
    Truncated,
}

/// One decoded address field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub callsign: String,
    pub ssid: u8,
}

impl Address {
    pub fn new(callsign: &str, ssid: u8) -> Self {
        Self {
            callsign: callsign.to_ascii_uppercase(),
            ssid: ssid & 0x0F,
        }
    }

    pub fn decode(field: &[u8]) -> Self {
        let callsign = field
            .iter()
            .take(6)
            .map(|b| (b >> 1) as char)
            .collect::<String>()
            .trim_end()
            .to_string();
        let ssid = field.get(6).map(|b| (b >> 1) & 0x0F).unwrap_or(0);
        Self { callsign, ssid }
    }

    /// Encode with the extension bit set when `last`
    pub fn encode(&self, last: bool) -> [u8; ADDRESS_LEN] {
        let mut field = [b' ' << 1; ADDRESS_LEN];
        for (slot, ch) in field.iter_mut().zip(self.callsign.bytes().take(6)) {
            *slot = ch << 1;
        }
        field[6] = 0x60 | (self.ssid << 1) | last as u8;
        field
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ssid == 0 {
            write!(f, "{}", self.callsign)
        } else {
            write!(f, "{}-{}", self.callsign, self.ssid)
        }
    }
}

/// Number of address fields, found by the extension bit
fn address_count(frame: &[u8]) -> Result<usize, FrameError> {
    for index in 0..MAX_ADDRESSES {
        let end = (index + 1) * ADDRESS_LEN;
        if end > frame.len() {
            return Err(FrameError::Truncated);
        }
        if frame[end - 1] & 0x01 != 0 {
            return Ok(index + 1);
        }
    }
    Err(FrameError::AddressUnterminated)
}

/// Check length and address structure of a received frame (FCS included)
pub fn check_frame(frame: &[u8]) -> Result<usize, FrameError> {
    if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&frame.len()) {
        return Err(FrameError::InvalidLength);
    }
    let count = address_count(frame)?;
    if count < 2 {
        return Err(FrameError::TooFewAddresses);
    }
    // Control byte plus FCS must follow the addresses
    if frame.len() < count * ADDRESS_LEN + 3 {
        return Err(FrameError::Truncated);
    }
    Ok(count)
}

pub fn is_valid_frame(frame: &[u8]) -> bool {
    check_frame(frame).is_ok()
}

/// Borrowed view of a structurally valid frame
#[derive(Debug, Clone)]
pub struct FrameView<'a> {
    pub destination: Address,
    pub source: Address,
    pub digipeaters: Vec<Address>,
    pub control: u8,
    pub pid: Option<u8>,
    pub info: &'a [u8],
}

impl<'a> FrameView<'a> {
    pub fn parse(frame: &'a [u8]) -> Result<Self, FrameError> {
        let count = check_frame(frame)?;
        let mut addresses = frame[..count * ADDRESS_LEN]
            .chunks(ADDRESS_LEN)
            .map(Address::decode);
        let destination = addresses.next().ok_or(FrameError::TooFewAddresses)?;
        let source = addresses.next().ok_or(FrameError::TooFewAddresses)?;
        let digipeaters = addresses.collect();

        let body = &frame[count * ADDRESS_LEN..frame.len() - 2];
        let control = body[0];
        // I and UI frames carry a PID
        let (pid, info) = if (control & 0x01 == 0 || control & 0xEF == CONTROL_UI) && body.len() > 1 {
            (Some(body[1]), &body[2..])
        } else {
            (None, &body[1..])
        };

        Ok(Self {
            destination,
            source,
            digipeaters,
            control,
            pid,
            info,
        })
    }
}

impl fmt::Display for FrameView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}>{}", self.source, self.destination)?;
        for digi in &self.digipeaters {
            write!(f, ",{}", digi)?;
        }
        write!(f, ":{}", String::from_utf8_lossy(self.info))
    }
}

/// Build a UI frame with FCS
pub fn encode_ui_frame(destination: &Address, source: &Address, path: &[Address], info: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity((2 + path.len()) * ADDRESS_LEN + 2 + info.len() + 2);
    frame.extend_from_slice(&destination.encode(false));
    frame.extend_from_slice(&source.encode(path.is_empty()));
    for (i, digi) in path.iter().enumerate() {
        frame.extend_from_slice(&digi.encode(i + 1 == path.len()));
    }
    frame.push(CONTROL_UI);
    frame.push(PID_NO_LAYER3);
    frame.extend_from_slice(info);
    super::crc::append_fcs(&mut frame);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ax25::check_fcs;

    #[test]
    fn test_address_decode() {
        let field = hex::decode("82A0A4A6404060").unwrap();
        let addr = Address::decode(&field);
        assert_eq!(addr.callsign, "APRS");
        assert_eq!(addr.ssid, 0);
        assert_eq!(addr.encode(false).to_vec(), field);

        let field = hex::decode("AE6488A08A9C75").unwrap();
        assert_eq!(Address::decode(&field).to_string(), "W2DPEN-10");
    }

    #[test]
    fn test_ui_frame() {
        let frame = encode_ui_frame(
            &Address::new("APRS", 0),
            &Address::new("N0CALL", 7),
            &[Address::new("WIDE1", 1)],
            b"!4903.50N/07201.75W-",
        );
        assert!(check_fcs(&frame));
        assert_eq!(check_frame(&frame), Ok(3));

        let view = FrameView::parse(&frame).unwrap();
        assert_eq!(view.to_string(), "N0CALL-7>APRS,WIDE1-1:!4903.50N/07201.75W-");
        assert_eq!(view.pid, Some(PID_NO_LAYER3));
    }

    #[test]
    fn test_minimum_frame() {
        let frame = encode_ui_frame(&Address::new("APRS", 0), &Address::new("N0CALL", 0), &[], b"");
        // Addresses, control, pid and FCS
        assert_eq!(frame.len(), MIN_FRAME_LEN + 1);
        assert!(is_valid_frame(&frame));
        assert!(is_valid_frame(&frame[..MIN_FRAME_LEN]));
        assert!(!is_valid_frame(&frame[..MIN_FRAME_LEN - 1]));
    }

    #[test]
    fn test_invalid_frames() {
        assert_eq!(check_frame(&[0u8; 10]), Err(FrameError::InvalidLength));
        assert_eq!(check_frame(&[0u8; MAX_FRAME_LEN + 1]), Err(FrameError::InvalidLength));

        // No extension bit anywhere
        assert_eq!(check_frame(&[0u8; 80]), Err(FrameError::AddressUnterminated));

        // Only one address
        let mut frame = Address::new("APRS", 0).encode(true).to_vec();
        frame.extend_from_slice(&[0x03, 0xF0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(check_frame(&frame), Err(FrameError::TooFewAddresses));
    }
}
