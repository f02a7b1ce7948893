//! Class-code decoding from grayscale frames.

use proxyzero_hw::Frame;

/// Extracts zero or more codes from a frame. Blocking, CPU-bound.
pub trait CodeDecoder: Send + Sync {
    fn decode(&self, frame: &Frame) -> Vec<String>;
}

/// QR decoder via `rqrr`.
#[derive(Debug, Default, Clone, Copy)]
pub struct QrDecoder;

impl CodeDecoder for QrDecoder {
    fn decode(&self, frame: &Frame) -> Vec<String> {
        let width = frame.width as usize;
        let height = frame.height as usize;
        if width == 0 || height == 0 || frame.data.len() < width * height {
            return Vec::new();
        }

        let mut prepared =
            rqrr::PreparedImage::prepare_from_greyscale(width, height, |x, y| frame.pixel(x, y));
        let grids = prepared.detect_grids();

        let mut codes = Vec::with_capacity(grids.len());
        for grid in grids {
            match grid.decode() {
                Ok((_, content)) => codes.push(content),
                Err(e) => tracing::trace!(error = %e, seq = frame.sequence, "grid failed to decode"),
            }
        }
        codes
    }
}
