//! Wire formats of the two devices a calibration run talks to.
//!
//! `encoder` covers the line protocol of the filament encoder, `gcode` the
//! G-code the motion controller understands in each supported firmware
//! dialect. Both are pure text codecs; the I/O lives in `crate::adapters`.

pub mod encoder;
pub mod gcode;

pub use encoder::{EncoderCommand, EncoderInfo, EncoderLine};
pub use gcode::FirmwareDialect;

/// Render a number without trailing zeros (`20.0` -> `20`, `94.1770` -> `94.177`).
pub fn format_number(value: f64, max_decimals: usize) -> String {
    let text = format!("{:.*}", max_decimals, value);
    if !text.contains('.') {
        return text;
    }
    let trimmed = text.trim_end_matches('0').trim_end_matches('.');
    if trimmed == "-0" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(20.0, 4), "20");
        assert_eq!(format_number(94.17721518987342, 3), "94.177");
        assert_eq!(format_number(0.5, 4), "0.5");
        assert_eq!(format_number(-0.00001, 3), "0");
        assert_eq!(format_number(600.0, 0), "600");
    }
}
