//! CRC-16 frame check sequence (CCITT, reflected, as used by HDLC/X.25)

/// Reflected form of polynomial 0x1021
const CRC16_POLY: u16 = 0x8408;

/// Register value after running the CRC over a frame including its FCS
pub const CRC_INCLUSIVE_CONSTANT: u16 = 0xF0B8;

/// Compute the CRC register over `data`. Initial value 0xFFFF, no final
/// inversion; the transmitted FCS is the complement of this value.
pub fn crc16_x25(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;

    for &byte in data {
        crc ^= byte as u16;

        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ CRC16_POLY;
            } else {
                crc >>= 1;
            }
        }
    }

    crc
}

/// True if a frame with its trailing FCS checks out
pub fn check_fcs(frame: &[u8]) -> bool {
    crc16_x25(frame) == CRC_INCLUSIVE_CONSTANT
}

/// Append the FCS for `frame`, low byte first
pub fn append_fcs(frame: &mut Vec<u8>) {
    let fcs = !crc16_x25(frame);
    frame.push((fcs & 0xFF) as u8);
    frame.push((fcs >> 8) as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        // CRC-16/X-25 check value over "123456789"
        assert_eq!(!crc16_x25(b"123456789"), 0x906E);
    }

    #[test]
    fn test_inclusive_constant() {
        let mut frame = hex::decode("82A0A4A6404060AE6488A08A9C6103F03E74657374").unwrap();
        append_fcs(&mut frame);
        assert_eq!(crc16_x25(&frame), CRC_INCLUSIVE_CONSTANT);
        assert!(check_fcs(&frame));
    }

    #[test]
    fn test_single_bit_error() {
        let mut frame = b"packet radio".to_vec();
        append_fcs(&mut frame);
        frame[3] ^= 0x10;
        assert!(!check_fcs(&frame));
    }
}
