use std::convert::Infallible;

use embedded_graphics::{
    pixelcolor::BinaryColor,
    prelude::{DrawTarget, OriginDimensions, Pixel, Size},
};
use image::{imageops, imageops::FilterType, DynamicImage, GrayImage, Luma};

use super::{FRAME_BYTES, HEIGHT, PAGES, WIDTH};

const THRESHOLD: u8 = 128;
const LIT: Luma<u8> = Luma([255]);
const DARK: Luma<u8> = Luma([0]);

/// A 128x64 one bit image, as it ends up on the panel
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pixels: GrayImage,
}

impl Default for Frame {
    fn default() -> Self {
        Self::blank()
    }
}

impl Frame {
    pub fn blank() -> Self {
        Self {
            pixels: GrayImage::from_pixel(WIDTH, HEIGHT, DARK),
        }
    }

    /// Converts any image to the panel format
    ///
    /// The image is scaled to fit keeping its aspect ratio, thresholded at half
    /// brightness and pasted onto the top left corner of a dark frame.
    pub fn from_image(image: &DynamicImage) -> Self {
        let mut luma = image.to_luma8();

        if luma.dimensions() != (WIDTH, HEIGHT) && luma.width() > 0 && luma.height() > 0 {
            let scale = f64::min(
                WIDTH as f64 / luma.width() as f64,
                HEIGHT as f64 / luma.height() as f64,
            );
            let width = ((luma.width() as f64 * scale).round() as u32).clamp(1, WIDTH);
            let height = ((luma.height() as f64 * scale).round() as u32).clamp(1, HEIGHT);

            luma = imageops::resize(&luma, width, height, FilterType::Nearest);
        }

        let mut frame = Self::blank();
        imageops::replace(&mut frame.pixels, &luma, 0, 0);
        for pixel in frame.pixels.pixels_mut() {
            *pixel = if pixel.0[0] >= THRESHOLD { LIT } else { DARK };
        }

        frame
    }

    pub fn is_lit(&self, x: u32, y: u32) -> bool {
        x < WIDTH && y < HEIGHT && self.pixels.get_pixel(x, y).0[0] >= THRESHOLD
    }

    pub fn set(&mut self, x: u32, y: u32, lit: bool) {
        if x < WIDTH && y < HEIGHT {
            self.pixels.put_pixel(x, y, if lit { LIT } else { DARK });
        }
    }

    pub fn invert(&mut self) {
        imageops::invert(&mut self.pixels);
    }

    pub fn lit_pixels(&self) -> usize {
        self.pixels.pixels().filter(|pixel| pixel.0[0] >= THRESHOLD).count()
    }

    pub fn as_image(&self) -> &GrayImage {
        &self.pixels
    }

    /// Panel memory layout, one byte per 8 pixel column of a page, top pixel in the LSB
    ///
    /// A rotation of 2 turns the frame upside down.
    pub fn pages(&self, rotation: u8) -> Vec<u8> {
        let mut buffer = vec![0; FRAME_BYTES];

        for page in 0..PAGES {
            for x in 0..WIDTH {
                let mut byte = 0u8;
                for bit in 0..8 {
                    let y = page * 8 + bit;
                    let lit = if rotation == 2 {
                        self.is_lit(WIDTH - 1 - x, HEIGHT - 1 - y)
                    } else {
                        self.is_lit(x, y)
                    };

                    if lit {
                        byte |= 1 << bit;
                    }
                }

                buffer[(page * WIDTH + x) as usize] = byte;
            }
        }

        buffer
    }
}

impl OriginDimensions for Frame {
    fn size(&self) -> Size {
        Size::new(WIDTH, HEIGHT)
    }
}

impl DrawTarget for Frame {
    type Color = BinaryColor;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(point, color) in pixels {
            if let (Ok(x), Ok(y)) = (u32::try_from(point.x), u32::try_from(point.y)) {
                self.set(x, y, color.is_on());
            }
        }

        Ok(())
    }
}
