//! Dallas/Maxim CRC-8 (polynomial x^8 + x^5 + x^4 + 1)

/// Reflected form of the 1-Wire CRC polynomial
const POLY_REFLECTED: u8 = 0x8C;

/// Compute the 1-Wire CRC-8 over `data`, LSB first, starting from zero
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        let mut b = byte;
        for _ in 0..8 {
            let mix = (crc ^ b) & 0x01;
            crc >>= 1;
            if mix != 0 {
                crc ^= POLY_REFLECTED;
            }
            b >>= 1;
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc8_known_rom() {
        // Application note example: family 0x02, serial 00000001B81C
        assert_eq!(crc8(&[0x02, 0x1C, 0xB8, 0x01, 0x00, 0x00, 0x00]), 0xA2);
    }

    #[test]
    fn test_crc8_residue_is_zero() {
        let mut rom = vec![0x28, 0xFF, 0x4C, 0x1A, 0x65, 0x15, 0x02];
        rom.push(crc8(&rom));
        assert_eq!(crc8(&rom), 0);
    }

    #[test]
    fn test_crc8_empty() {
        assert_eq!(crc8(&[]), 0);
    }
}
