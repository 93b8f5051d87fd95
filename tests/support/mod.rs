//! Shared helpers for integration tests.

#![allow(dead_code)]

pub mod socket_guard;

use std::io::Cursor;

use image::{ImageFormat, Rgb, RgbImage};

/// A small solid-colour JPEG; `shade` makes pages distinguishable.
pub fn page_jpeg(shade: u8) -> Vec<u8> {
    let img = RgbImage::from_pixel(8, 12, Rgb([shade, shade / 2, 255 - shade]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Jpeg)
        .expect("encode test jpeg");
    out.into_inner()
}
