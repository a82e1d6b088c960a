use image::{ImageBuffer, Luma};
use ndarray::Array2;

/// `(height, width)` shaped array of the pixel values
pub fn luma32f_to_array2(image: &ImageBuffer<Luma<f32>, Vec<f32>>) -> Array2<f64> {
    Array2::from_shape_fn(
        (image.height() as usize, image.width() as usize),
        |(y, x)| image.get_pixel(x as u32, y as u32).0[0] as f64,
    )
}

pub fn array2_to_luma32f(mat: &Array2<f64>) -> ImageBuffer<Luma<f32>, Vec<f32>> {
    let (height, width) = mat.dim();
    ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        Luma([mat[[y as usize, x as usize]] as f32])
    })
}

pub fn luma32f_to_luma8(image: &ImageBuffer<Luma<f32>, Vec<f32>>) -> ImageBuffer<Luma<u8>, Vec<u8>> {
    ImageBuffer::from_fn(image.width(), image.height(), |x, y| {
        Luma([(image.get_pixel(x, y).0[0].clamp(0.0, 1.0) * 255.0).round() as u8])
    })
}
