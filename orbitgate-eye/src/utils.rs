//! Image conversion helpers

use image::DynamicImage;
use ndarray::Array2;

/// Single-channel intensity array (rows x cols) with values in `[0, 255]`
pub fn image_to_intensity(image: &DynamicImage) -> Array2<f32> {
    let gray = image.to_luma8();
    let (width, height) = gray.dimensions();
    let data: Vec<f32> = gray.into_raw().into_iter().map(f32::from).collect();
    // Dimensions come from the buffer itself, so the shape always matches
    Array2::from_shape_vec((height as usize, width as usize), data)
        .unwrap_or_else(|_| Array2::zeros((0, 0)))
}

/// Boolean mask from a grayscale image; non-zero pixels are set
pub fn image_to_mask(image: &DynamicImage) -> Array2<bool> {
    image_to_intensity(image).mapv(|v| v > 0.0)
}
