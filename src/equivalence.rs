//! Pixel-level comparison of an original image with an optimizer's output.
//!
//! Both images are decoded to 16-bit RGBA, so a 16-bit PNG is compared at
//! full precision while 8-bit samples scale exactly (`v * 257`). Two images are equivalent when they have
//! the same dimensions and every pixel matches exactly, except that a pixel
//! which is fully transparent in the original only needs to be fully
//! transparent in the candidate: its colour channels are invisible and
//! encoders are free to store anything there.
use std::fmt;

/// A decoded image as a row-major grid of 16-bit RGBA pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelGrid {
    width: u32,
    height: u32,
    pixels: Vec<[u16; 4]>,
}

impl PixelGrid {
    /// Builds a grid, returning `None` if `pixels` does not hold exactly
    /// `width * height` entries.
    pub fn new(width: u32, height: u32, pixels: Vec<[u16; 4]>) -> Option<Self> {
        let expected = u64::from(width) * u64::from(height);
        (pixels.len() as u64 == expected).then_some(Self {
            width,
            height,
            pixels,
        })
    }
    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }
    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }
    /// The pixel at `(x, y)`, or `None` outside the grid.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u16; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let index = y as usize * self.width as usize + x as usize;
        self.pixels.get(index).copied()
    }
}

/// Turns encoded image bytes into pixels.
pub trait PixelDecoder: Send + Sync {
    /// Decodes `bytes`, describing the problem on failure.
    fn decode(&self, bytes: &[u8]) -> Result<PixelGrid, String>;
}

impl<D: PixelDecoder + ?Sized> PixelDecoder for Box<D> {
    fn decode(&self, bytes: &[u8]) -> Result<PixelGrid, String> {
        (**self).decode(bytes)
    }
}

/// [`PixelDecoder`] built on the `image` crate.
///
/// Every colour type is converted to 16-bit RGBA first, so an optimizer that
/// turned RGBA into a palette, dropped an all-opaque alpha channel or changed
/// the bit depth without losing precision still compares equal.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageDecoder;

impl PixelDecoder for ImageDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<PixelGrid, String> {
        let rgba = image::load_from_memory(bytes)
            .map_err(|e| e.to_string())?
            .to_rgba16();
        let (width, height) = rgba.dimensions();
        let pixels = rgba.pixels().map(|p| p.0).collect();
        PixelGrid::new(width, height, pixels).ok_or_else(|| "pixel buffer size mismatch".to_string())
    }
}

/// Result of comparing two decoded images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparison {
    /// Every pixel matches under the transparency rule.
    Equivalent,
    /// The images have different sizes.
    DimensionMismatch {
        /// `(width, height)` of the original.
        original: (u32, u32),
        /// `(width, height)` of the candidate.
        candidate: (u32, u32),
    },
    /// The first differing pixel in row-major order.
    PixelMismatch {
        /// Column of the pixel.
        x: u32,
        /// Row of the pixel.
        y: u32,
        /// The original's 16-bit RGBA value.
        original: [u16; 4],
        /// The candidate's 16-bit RGBA value.
        candidate: [u16; 4],
    },
}

impl Comparison {
    /// Whether this is [`Comparison::Equivalent`].
    pub fn is_equivalent(&self) -> bool {
        matches!(self, Comparison::Equivalent)
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Comparison::Equivalent => f.write_str("images are equivalent"),
            Comparison::DimensionMismatch {
                original,
                candidate,
            } => write!(
                f,
                "dimensions differ: {}x{} vs {}x{}",
                original.0, original.1, candidate.0, candidate.1
            ),
            Comparison::PixelMismatch {
                x,
                y,
                original,
                candidate,
            } => write!(
                f,
                "pixel ({x}, {y}) differs: rgba{original:?} vs rgba{candidate:?}"
            ),
        }
    }
}

/// Whether `candidate` may stand in for `original` at one position.
pub fn pixels_equal(original: [u16; 4], candidate: [u16; 4]) -> bool {
    if original[3] == 0 {
        return candidate[3] == 0;
    }
    original == candidate
}

/// Compares two decoded images under the transparency rule.
pub fn compare_grids(original: &PixelGrid, candidate: &PixelGrid) -> Comparison {
    if (original.width, original.height) != (candidate.width, candidate.height) {
        return Comparison::DimensionMismatch {
            original: (original.width, original.height),
            candidate: (candidate.width, candidate.height),
        };
    }
    let mismatch = original
        .pixels
        .iter()
        .zip(&candidate.pixels)
        .position(|(a, b)| !pixels_equal(*a, *b));
    match mismatch {
        None => Comparison::Equivalent,
        Some(index) => {
            let width = original.width as usize;
            Comparison::PixelMismatch {
                x: (index % width) as u32,
                y: (index / width) as u32,
                original: original.pixels[index],
                candidate: candidate.pixels[index],
            }
        }
    }
}

/// Decodes and compares encoded images.
#[derive(Debug, Clone, Default)]
pub struct EquivalenceChecker<D = ImageDecoder> {
    decoder: D,
}

impl EquivalenceChecker<ImageDecoder> {
    /// A checker decoding with the `image` crate.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<D: PixelDecoder> EquivalenceChecker<D> {
    /// A checker decoding with `decoder`.
    pub fn with_decoder(decoder: D) -> Self {
        Self { decoder }
    }
    /// Decodes one side, for callers that compare against it repeatedly.
    pub fn decode(&self, bytes: &[u8]) -> Result<PixelGrid, String> {
        self.decoder.decode(bytes)
    }
    /// `true` only if both decode and the candidate is equivalent.
    pub fn equivalent(&self, original: &[u8], candidate: &[u8]) -> bool {
        matches!(self.compare(original, candidate), Ok(Comparison::Equivalent))
    }
    /// Like [`equivalent`](Self::equivalent) but says where the images
    /// diverge. A decode failure of either side is an `Err`.
    pub fn compare(&self, original: &[u8], candidate: &[u8]) -> Result<Comparison, String> {
        let original = self
            .decoder
            .decode(original)
            .map_err(|e| format!("original: {e}"))?;
        self.compare_to(&original, candidate)
    }
    /// Compares against an original that was decoded once up front.
    pub fn compare_to(&self, original: &PixelGrid, candidate: &[u8]) -> Result<Comparison, String> {
        let candidate = self
            .decoder
            .decode(candidate)
            .map_err(|e| format!("candidate: {e}"))?;
        Ok(compare_grids(original, &candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(width: u32, height: u32, pixels: &[[u16; 4]]) -> PixelGrid {
        PixelGrid::new(width, height, pixels.to_vec()).unwrap()
    }

    #[test]
    fn transparent_pixels_ignore_colour() {
        let original = grid(2, 1, &[[10, 20, 30, 0], [1, 2, 3, 255]]);
        let candidate = grid(2, 1, &[[0, 0, 0, 0], [1, 2, 3, 255]]);
        assert_eq!(compare_grids(&original, &candidate), Comparison::Equivalent);
    }

    #[test]
    fn alpha_must_still_match() {
        let original = grid(2, 1, &[[10, 20, 30, 0], [1, 2, 3, 255]]);
        let candidate = grid(2, 1, &[[10, 20, 30, 1], [1, 2, 3, 255]]);
        assert_eq!(
            compare_grids(&original, &candidate),
            Comparison::PixelMismatch {
                x: 0,
                y: 0,
                original: [10, 20, 30, 0],
                candidate: [10, 20, 30, 1],
            }
        );
    }

    #[test]
    fn translucent_pixels_compare_every_channel() {
        assert!(pixels_equal([5, 5, 5, 128], [5, 5, 5, 128]));
        assert!(!pixels_equal([5, 5, 5, 128], [5, 5, 6, 128]));
        assert!(!pixels_equal([5, 5, 5, 255], [5, 5, 5, 0]));
    }

    #[test]
    fn reports_first_mismatch_coordinates() {
        let original = grid(2, 2, &[[0, 0, 0, 255]; 4]);
        let mut pixels = [[0, 0, 0, 255]; 4];
        pixels[3] = [0, 0, 1, 255];
        let candidate = grid(2, 2, &pixels);
        let comparison = compare_grids(&original, &candidate);
        assert!(matches!(comparison, Comparison::PixelMismatch { x: 1, y: 1, .. }));
        assert_eq!(
            comparison.to_string(),
            "pixel (1, 1) differs: rgba[0, 0, 0, 255] vs rgba[0, 0, 1, 255]"
        );
    }

    #[test]
    fn dimensions_always_differ() {
        let original = grid(2, 1, &[[0, 0, 0, 0]; 2]);
        let candidate = grid(1, 2, &[[0, 0, 0, 0]; 2]);
        assert!(matches!(
            compare_grids(&original, &candidate),
            Comparison::DimensionMismatch { .. }
        ));
    }

    #[test]
    fn rejects_short_buffers() {
        assert!(PixelGrid::new(2, 2, vec![[0; 4]; 3]).is_none());
        assert_eq!(grid(1, 1, &[[9; 4]]).pixel(1, 0), None);
    }

    #[test]
    fn low_byte_of_wide_samples_counts() {
        let original = grid(1, 1, &[[0x1234, 0x1234, 0x1234, 0xFFFF]]);
        let candidate = grid(1, 1, &[[0x1200, 0x1234, 0x1234, 0xFFFF]]);
        assert!(!compare_grids(&original, &candidate).is_equivalent());
    }

    struct Flat(u16);

    impl PixelDecoder for Flat {
        fn decode(&self, bytes: &[u8]) -> Result<PixelGrid, String> {
            let width = u32::try_from(bytes.len()).map_err(|e| e.to_string())?;
            PixelGrid::new(width, 1, vec![[self.0; 4]; bytes.len()])
                .ok_or_else(|| "bad grid".to_string())
        }
    }

    #[test]
    fn custom_decoder_is_used() {
        let checker = EquivalenceChecker::with_decoder(Flat(7));
        assert!(checker.equivalent(b"abc", b"xyz"));
        assert!(matches!(
            checker.compare(b"abc", b"wxyz"),
            Ok(Comparison::DimensionMismatch {
                original: (3, 1),
                candidate: (4, 1)
            })
        ));
    }

    #[test]
    fn undecodable_bytes_are_not_equivalent() {
        let checker = EquivalenceChecker::new();
        assert!(!checker.equivalent(b"not an image", b"not an image"));
        assert!(checker.compare(b"not an image", b"").is_err());
    }
}
