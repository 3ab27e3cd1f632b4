use super::processor::{smart_resize, IMAGE_FACTOR};
use crate::{ContentBlock, Conversation, ImageSource};
use image::{imageops::FilterType, DynamicImage, GenericImageView};

pub const MIN_PIXELS: u32 = 4 * 28 * 28;
pub const MAX_PIXELS: u32 = 16384 * 28 * 28;
pub const VIDEO_MIN_PIXELS: u32 = 128 * 28 * 28;
pub const VIDEO_MAX_PIXELS: u32 = 768 * 28 * 28;
pub const FRAME_FACTOR: usize = 2;

fn resize_to(image: DynamicImage, height: u32, width: u32) -> DynamicImage {
    if image.dimensions() == (width, height) {
        image
    } else {
        image.resize_exact(width, height, FilterType::CatmullRom)
    }
}

fn fetch_image(
    source: &ImageSource,
    resized_height: Option<u32>,
    resized_width: Option<u32>,
) -> anyhow::Result<DynamicImage> {
    let image = DynamicImage::ImageRgb8(source.load()?.to_rgb8());
    let (height, width) = match (resized_height, resized_width) {
        (Some(h), Some(w)) => smart_resize(h, w, IMAGE_FACTOR, MIN_PIXELS, MAX_PIXELS)?,
        _ => {
            let (w, h) = image.dimensions();
            smart_resize(h, w, IMAGE_FACTOR, MIN_PIXELS, MAX_PIXELS)?
        }
    };
    Ok(resize_to(image, height, width))
}

fn fetch_video(frames: &[ImageSource]) -> anyhow::Result<Vec<DynamicImage>> {
    let mut images = frames
        .iter()
        .map(|f| Ok(DynamicImage::ImageRgb8(f.load()?.to_rgb8())))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let Some(first) = images.first() else {
        anyhow::bail!("video block holds no frames");
    };
    let (w, h) = first.dimensions();
    let (height, width) = smart_resize(h, w, IMAGE_FACTOR, VIDEO_MIN_PIXELS, VIDEO_MAX_PIXELS)?;
    while images.len() % FRAME_FACTOR != 0 {
        images.push(images[images.len() - 1].clone());
    }
    Ok(images
        .into_iter()
        .map(|image| resize_to(image, height, width))
        .collect())
}

/// Loads every image and video referenced by `conversations`, in block order.
pub fn process_vision_info(
    conversations: &[Conversation],
) -> anyhow::Result<(Vec<DynamicImage>, Vec<Vec<DynamicImage>>)> {
    let mut images = vec![];
    let mut videos = vec![];
    for block in conversations
        .iter()
        .flatten()
        .flat_map(|message| &message.content)
    {
        match block {
            ContentBlock::Image {
                image,
                resized_height,
                resized_width,
            } => images.push(fetch_image(image, *resized_height, *resized_width)?),
            ContentBlock::Video { video } => videos.push(fetch_video(video)?),
            ContentBlock::Text { .. } => {}
        }
    }
    Ok((images, videos))
}
