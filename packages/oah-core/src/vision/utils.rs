use image::{DynamicImage, Rgba};
use imageproc::{
    drawing::{draw_cross_mut, draw_hollow_rect_mut},
    rect::Rect,
};

use super::Match;

const BOX_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);

/// Draw a box and a cross at the centre of every match, for debug screenshots
pub fn annotate(screen: &DynamicImage, matches: &[Match]) -> DynamicImage {
    let mut image = screen.to_rgba8();
    for m in matches {
        draw_box(&mut image, m, BOX_COLOR);
    }
    DynamicImage::ImageRgba8(image)
}

fn draw_box(image: &mut image::RgbaImage, m: &Match, color: Rgba<u8>) {
    if m.rect.width == 0 || m.rect.height == 0 {
        return;
    }
    let rect = Rect::at(m.rect.x as i32, m.rect.y as i32).of_size(m.rect.width, m.rect.height);
    draw_hollow_rect_mut(image, rect, color);
    draw_cross_mut(image, color, m.center.0 as i32, m.center.1 as i32);
}
