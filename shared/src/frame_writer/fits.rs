//! FITS encoder built on CFITSIO.
//!
//! RAW8/Y8 frames become 8-bit unsigned images, RAW16 becomes 16-bit unsigned
//! (the sensor delivers little-endian samples) and RGB24 becomes a three-plane
//! cube ordered R, G, B. With compression enabled the primary HDU is left
//! empty and the pixels go into a tile-compressed image extension.

use super::{Compression, FrameEncoder, FrameHeader, FrameRecord, HeaderValue, WriteError};
use crate::camera_interface::PixelFormat;
use fitsio::hdu::FitsHdu;
use fitsio::images::{ImageDescription, ImageType};
use fitsio::FitsFile;
use std::path::Path;
use tracing::debug;

fn encoder_error(e: fitsio::errors::Error) -> WriteError {
    WriteError::Encoder(e.to_string())
}

/// CFITSIO extended-filename suffix for a compression mode
fn compression_suffix(compression: Compression) -> Option<&'static str> {
    match compression {
        Compression::None => None,
        Compression::Rice => Some("[compress R]"),
        Compression::Gzip => Some("[compress G]"),
        Compression::Plio => Some("[compress P]"),
    }
}

enum Pixels {
    Bytes(Vec<u8>),
    Shorts(Vec<u16>),
}

/// Reorder interleaved BGR samples into consecutive R, G and B planes
fn bgr_to_planes(buffer: &[u8]) -> Vec<u8> {
    let pixels = buffer.len() / 3;
    let mut planes = vec![0u8; pixels * 3];
    for (i, bgr) in buffer.chunks_exact(3).enumerate() {
        planes[i] = bgr[2];
        planes[pixels + i] = bgr[1];
        planes[2 * pixels + i] = bgr[0];
    }
    planes
}

fn le_samples(buffer: &[u8]) -> Vec<u16> {
    buffer
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Writes frames as `.fits` files
#[derive(Debug, Clone, Copy, Default)]
pub struct FitsEncoder;

impl FitsEncoder {
    pub fn new() -> Self {
        Self
    }

    fn write_header(
        hdu: &FitsHdu,
        fptr: &mut FitsFile,
        header: &FrameHeader,
    ) -> Result<(), WriteError> {
        for (key, value) in header.iter() {
            match value {
                HeaderValue::Int(v) => hdu.write_key(fptr, key, *v),
                HeaderValue::Float(v) => hdu.write_key(fptr, key, *v),
                HeaderValue::Str(v) => hdu.write_key(fptr, key, v.clone()),
            }
            .map_err(encoder_error)?;
        }
        Ok(())
    }
}

impl FrameEncoder for FitsEncoder {
    fn extension(&self) -> &str {
        "fits"
    }

    fn write(
        &self,
        path: &Path,
        record: &FrameRecord,
        header: &FrameHeader,
        compression: Compression,
        overwrite: bool,
    ) -> Result<(), WriteError> {
        record.validate()?;

        if path.exists() {
            if !overwrite {
                return Err(WriteError::AlreadyExists(path.to_path_buf()));
            }
            std::fs::remove_file(path)?;
        }

        let width = record.size.width as usize;
        let height = record.size.height as usize;
        let (pixels, data_type, dimensions) = match record.pixel_format {
            PixelFormat::Raw8 | PixelFormat::Y8 => (
                Pixels::Bytes(record.pixel_buffer.clone()),
                ImageType::UnsignedByte,
                vec![height, width],
            ),
            PixelFormat::Raw16 => (
                Pixels::Shorts(le_samples(&record.pixel_buffer)),
                ImageType::UnsignedShort,
                vec![height, width],
            ),
            PixelFormat::Rgb24 => (
                Pixels::Bytes(bgr_to_planes(&record.pixel_buffer)),
                ImageType::UnsignedByte,
                vec![3, height, width],
            ),
        };
        let description = ImageDescription {
            data_type,
            dimensions: &dimensions,
        };

        let (mut fptr, hdu) = match compression_suffix(compression) {
            None => {
                let mut fptr = FitsFile::create(path)
                    .with_custom_primary(&description)
                    .open()
                    .map_err(encoder_error)?;
                let hdu = fptr.primary_hdu().map_err(encoder_error)?;
                (fptr, hdu)
            }
            Some(suffix) => {
                let target = format!("{}{}", path.display(), suffix);
                let mut fptr = FitsFile::create(target).open().map_err(encoder_error)?;
                let hdu = fptr
                    .create_image("COMPRESSED_IMAGE".to_string(), &description)
                    .map_err(encoder_error)?;
                (fptr, hdu)
            }
        };

        match &pixels {
            Pixels::Bytes(data) => hdu.write_image(&mut fptr, &data[..]),
            Pixels::Shorts(data) => hdu.write_image(&mut fptr, &data[..]),
        }
        .map_err(encoder_error)?;
        Self::write_header(&hdu, &mut fptr, header)?;

        debug!(
            "Encoded {} {} frame {} ({})",
            record.size,
            record.pixel_format,
            record.sequence,
            compression
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_writer::test_support::sample_record;
    use crate::frame_writer::{build_header, HeaderContext};
    use crate::image_size::ImageSize;
    use tempfile::TempDir;

    fn context() -> HeaderContext {
        HeaderContext {
            instrument: "Mock ASI294MM Pro".to_string(),
            pixel_size_um: 4.63,
            target_temperature_c: None,
        }
    }

    #[test]
    fn test_bgr_planes() {
        let planes = bgr_to_planes(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(planes, vec![3, 6, 2, 5, 1, 4]);
    }

    #[test]
    fn test_little_endian_samples() {
        assert_eq!(le_samples(&[0x34, 0x12, 0xff, 0x00]), vec![0x1234, 0x00ff]);
    }

    #[test]
    fn test_write_raw16_with_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("frame000007.fits");
        let mut record = sample_record();
        record.pixel_buffer = (0..16).collect();
        let header = build_header(&record, &context());

        FitsEncoder
            .write(&path, &record, &header, Compression::None, false)
            .unwrap();

        let mut fptr = FitsFile::open(&path).unwrap();
        let hdu = fptr.primary_hdu().unwrap();
        let pixels: Vec<u16> = hdu.read_image(&mut fptr).unwrap();
        assert_eq!(pixels[0], 0x0100);
        assert_eq!(pixels.len(), 8);
        let framenum: i64 = hdu.read_key(&mut fptr, "FRAMENUM").unwrap();
        assert_eq!(framenum, 7);
        let date_obs: String = hdu.read_key(&mut fptr, "DATE-OBS").unwrap();
        assert_eq!(date_obs, "2024-03-01T12:00:00.000");
    }

    #[test]
    fn test_existing_file_not_overwritten() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("frame000007.fits");
        std::fs::write(&path, b"keep").unwrap();
        let record = sample_record();

        let result = FitsEncoder.write(&path, &record, &FrameHeader::new(), Compression::None, false);
        assert!(matches!(result, Err(WriteError::AlreadyExists(_))));
        assert_eq!(std::fs::read(&path).unwrap(), b"keep");

        FitsEncoder
            .write(&path, &record, &FrameHeader::new(), Compression::None, true)
            .unwrap();
        assert_ne!(std::fs::read(&path).unwrap(), b"keep");
    }

    #[test]
    fn test_rice_compressed_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("frame000000.fits");
        let record = FrameRecord {
            size: ImageSize::from_width_height(16, 16),
            pixel_format: PixelFormat::Raw8,
            pixel_buffer: vec![7; 256],
            ..sample_record()
        };
        let header = build_header(&record, &context());

        FitsEncoder
            .write(&path, &record, &header, Compression::Rice, false)
            .unwrap();

        let mut fptr = FitsFile::open(&path).unwrap();
        let hdu = fptr.hdu(1).unwrap();
        let pixels: Vec<u8> = hdu.read_image(&mut fptr).unwrap();
        assert!(pixels.iter().all(|&p| p == 7));
        let binning: i64 = hdu.read_key(&mut fptr, "XBINNING").unwrap();
        assert_eq!(binning, 2);
    }
}
