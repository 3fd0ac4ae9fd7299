//! ESP application image header inspection
//!
//! Both application images and full flash dumps of the reader's ESP32-C3 start with the ROM
//! bootloader's image header. The header is only used for informational output; it does not take
//! part in firmware classification.

use std::fmt;
use std::io::{self, Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use num_enum::{FromPrimitive, IntoPrimitive};
use thiserror::Error;

/// The first byte of every image
pub const IMAGE_MAGIC: u8 = 0xE9;

/// Length of the common and extended header
pub const HEADER_LEN: usize = 24;

#[derive(Error, Debug)]
pub enum ImageHeaderError {
    #[error("The magic header value is invalid: {:#04x}", _0)]
    InvalidMagicHeader(u8),
    #[error("I/O error: {}", _0)]
    IoError(#[from] io::Error),
}

/// The chip an image was built for
#[repr(u16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, FromPrimitive)]
pub enum ChipId {
    Esp32 = 0x0000,
    Esp32S2 = 0x0002,
    Esp32C3 = 0x0005,
    Esp32S3 = 0x0009,
    Esp32C2 = 0x000c,
    Esp32C6 = 0x000d,
    Esp32H2 = 0x0010,
    #[num_enum(default)]
    Unknown = 0xffff,
}

impl fmt::Display for ChipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChipId::Esp32 => "ESP32",
            ChipId::Esp32S2 => "ESP32-S2",
            ChipId::Esp32C3 => "ESP32-C3",
            ChipId::Esp32S3 => "ESP32-S3",
            ChipId::Esp32C2 => "ESP32-C2",
            ChipId::Esp32C6 => "ESP32-C6",
            ChipId::Esp32H2 => "ESP32-H2",
            ChipId::Unknown => "unknown chip",
        };

        f.write_str(name)
    }
}

/// SPI flash access mode
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, FromPrimitive)]
pub enum SpiMode {
    Qio = 0,
    Qout = 1,
    Dio = 2,
    Dout = 3,
    FastRead = 4,
    SlowRead = 5,
    #[num_enum(default)]
    Unknown = 0xff,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ImageHeader {
    /// Number of memory segments following the header
    pub segment_count: u8,
    pub spi_mode: SpiMode,
    /// Flash size code, upper nibble of the fourth byte
    pub flash_size_code: u8,
    /// Flash frequency code, lower nibble of the fourth byte
    pub flash_freq_code: u8,
    pub entry_point: u32,
    pub chip: ChipId,
    /// Minimum chip revision, as `major * 100 + minor`
    pub min_chip_revision: u16,
    /// Maximum chip revision, as `major * 100 + minor`
    pub max_chip_revision: u16,
    /// Whether a SHA-256 digest is appended to the image
    pub hash_appended: bool,
}

impl ImageHeader {
    /// Parses the header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<ImageHeader, ImageHeaderError> {
        ImageHeader::from_reader(Cursor::new(data))
    }

    pub fn from_reader<R: Read>(mut reader: R) -> Result<ImageHeader, ImageHeaderError> {
        // Read and check the magic byte
        let magic = reader.read_u8()?;

        if magic != IMAGE_MAGIC {
            return Err(ImageHeaderError::InvalidMagicHeader(magic));
        }

        let segment_count = reader.read_u8()?;
        let spi_mode = SpiMode::from(reader.read_u8()?);

        // Flash size and frequency share a byte
        let size_freq = reader.read_u8()?;
        let entry_point = reader.read_u32::<LittleEndian>()?;

        // Skip the write protect pin and the SPI pin drive settings
        let mut pins = [0u8; 4];
        reader.read_exact(&mut pins)?;

        let chip = ChipId::from(reader.read_u16::<LittleEndian>()?);

        // The single byte revision field is superseded by the full revision that follows
        let _ = reader.read_u8()?;

        let min_chip_revision = reader.read_u16::<LittleEndian>()?;
        let max_chip_revision = reader.read_u16::<LittleEndian>()?;

        let mut reserved = [0u8; 4];
        reader.read_exact(&mut reserved)?;

        let hash_appended = reader.read_u8()? == 1;

        Ok(ImageHeader {
            segment_count,
            spi_mode,
            flash_size_code: size_freq >> 4,
            flash_freq_code: size_freq & 0x0f,
            entry_point,
            chip,
            min_chip_revision,
            max_chip_revision,
            hash_appended,
        })
    }

    /// The flash size the image was built for, in bytes.
    pub fn flash_size(&self) -> Option<usize> {
        match self.flash_size_code {
            code @ 0..=7 => Some((1024 * 1024) << code),
            _ => None,
        }
    }

    /// The flash frequency the image was built for, in MHz.
    pub fn flash_frequency_mhz(&self) -> Option<u8> {
        match self.flash_freq_code {
            0x0 => Some(40),
            0x1 => Some(26),
            0x2 => Some(20),
            0xf => Some(80),
            _ => None,
        }
    }
}

impl fmt::Display for ImageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} image, {} segments, entry {:#010x}, {:?}",
            self.chip, self.segment_count, self.entry_point, self.spi_mode
        )?;

        if let Some(size) = self.flash_size() {
            write!(f, ", {} MB flash", size / (1024 * 1024))?;
        }

        if let Some(freq) = self.flash_frequency_mhz() {
            write!(f, " @ {} MHz", freq)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_hex::*;
    use hex_literal::hex;

    use super::*;

    const C3_HEADER: [u8; HEADER_LEN] =
        hex!("E9 03 02 4F 80 00 38 40 EE 00 00 00 05 00 00 03 00 63 00 00 00 00 00 01");

    #[test]
    fn it_should_parse_an_esp32c3_header() {
        let header = ImageHeader::parse(&C3_HEADER).unwrap();

        assert_eq!(header.segment_count, 3);
        assert_eq!(header.spi_mode, SpiMode::Dio);
        assert_eq!(header.chip, ChipId::Esp32C3);
        assert_eq_hex!(header.entry_point, 0x4038_0080);
        assert_eq!(header.min_chip_revision, 3);
        assert_eq!(header.max_chip_revision, 99);
        assert_eq!(header.flash_size(), Some(16 * 1024 * 1024));
        assert_eq!(header.flash_frequency_mhz(), Some(80));
        assert!(header.hash_appended);
    }

    #[test]
    fn it_should_reject_an_invalid_magic() {
        let err = ImageHeader::parse(b"XTOS V3.0.8 build").unwrap_err();

        assert!(matches!(err, ImageHeaderError::InvalidMagicHeader(b'X')));
    }

    #[test]
    fn it_should_fail_on_a_truncated_header() {
        let err = ImageHeader::parse(&C3_HEADER[..12]).unwrap_err();

        assert!(matches!(err, ImageHeaderError::IoError(_)));
    }

    #[test]
    fn it_should_map_unknown_chip_ids() {
        let mut data = C3_HEADER;
        data[12] = 0x42;

        let header = ImageHeader::parse(&data).unwrap();

        assert_eq!(header.chip, ChipId::Unknown);
        assert_eq!(u16::from(ChipId::Esp32S3), 9);
    }
}
