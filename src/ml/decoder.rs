//! 画像デコード
//!
//! アップロードされたバイト列を画素配列に変換します。
//! チャネル数は元画像のまま保持し、RGBへの正規化は前処理側で行います。

use image::{DynamicImage, ImageReader};
use std::io::Cursor;

use crate::error::{Result, RetinaError};
use crate::types::PixelGrid;
use crate::upload::UploadedImage;

/// バイト列を画素配列にデコード
///
/// 先頭のマジックバイトからフォーマットを推定し、判定できない場合は
/// 宣言された拡張子のフォーマットでデコードします。
pub fn decode(raw: &UploadedImage) -> Result<PixelGrid> {
    let mut reader = ImageReader::new(Cursor::new(raw.bytes()))
        .with_guessed_format()
        .map_err(|e| RetinaError::Decode(e.to_string()))?;
    if reader.format().is_none() {
        reader.set_format(raw.format().image_format());
    }

    let image = reader
        .decode()
        .map_err(|e| RetinaError::Decode(e.to_string()))?;

    tracing::debug!(
        width = image.width(),
        height = image.height(),
        color = ?image.color(),
        "画像をデコードしました"
    );

    into_pixel_grid(image)
}

/// DynamicImageを8bitの画素配列に変換
pub(crate) fn into_pixel_grid(image: DynamicImage) -> Result<PixelGrid> {
    let width = image.width() as usize;
    let height = image.height() as usize;

    let (channels, raw) = match image {
        DynamicImage::ImageLuma8(buf) => (1, buf.into_raw()),
        DynamicImage::ImageLumaA8(buf) => (2, buf.into_raw()),
        DynamicImage::ImageRgb8(buf) => (3, buf.into_raw()),
        DynamicImage::ImageRgba8(buf) => (4, buf.into_raw()),
        other => {
            let color = other.color();
            match (color.has_color(), color.has_alpha()) {
                (false, false) => (1, other.to_luma8().into_raw()),
                (false, true) => (2, other.to_luma_alpha8().into_raw()),
                (true, false) => (3, other.to_rgb8().into_raw()),
                (true, true) => (4, other.to_rgba8().into_raw()),
            }
        }
    };

    PixelGrid::from_raw(height, width, channels, raw)
}
