//! MAX31725 register-level protocol.
//!
//! Only the subset the insole uses: shutdown configuration, one-shot
//! conversions and the two-byte temperature register.

/// Temperature register: integer °C byte followed by the fraction byte.
pub const REG_TEMPERATURE: u8 = 0x00;
/// Configuration register.
pub const REG_CONFIGURATION: u8 = 0x01;

/// Configuration bit: shutdown mode, required for one-shot operation.
pub const CONFIG_SHUTDOWN: u8 = 0x01;
/// Configuration bit: triggers a one-shot conversion; reads back high while
/// the conversion is still running.
pub const CONFIG_ONE_SHOT: u8 = 0x80;

/// Packs the two temperature register bytes into the transmitted code.
///
/// The code is `2 × °C`: the integer byte shifted up one, plus the
/// half-degree bit from the top of the fraction byte. Finer fraction bits
/// are discarded.
pub const fn temperature_code(integer: u8, fraction: u8) -> u8 {
    let mut code = integer << 1;
    if fraction & 0x80 != 0 {
        code += 1;
    }
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_degrees() {
        // 25.0 °C -> code 50
        assert_eq!(temperature_code(25, 0x00), 50);
    }

    #[test]
    fn half_degree_bit() {
        // 25.5 °C -> code 51
        assert_eq!(temperature_code(25, 0x80), 51);
    }

    #[test]
    fn finer_fraction_bits_are_dropped() {
        // 25.25 °C rounds down to 25.0
        assert_eq!(temperature_code(25, 0x40), 50);
    }

    #[test]
    fn zero_reads_as_zero() {
        assert_eq!(temperature_code(0, 0x00), 0);
    }
}
