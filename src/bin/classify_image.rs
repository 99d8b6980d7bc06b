//! 眼底画像1枚を分類するツール
//!
//! 使い方: classify_image <image> [--config <config.json>]

use anyhow::{Context, Result};
use retina_classifier_lib::model::AppConfig;
use retina_classifier_lib::{ClassificationPipeline, UploadedImage};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let mut image_path: Option<PathBuf> = None;
    let mut config_path = AppConfig::default_path();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                config_path = PathBuf::from(args.next().context("--config にはパスが必要です")?);
            }
            _ => image_path = Some(PathBuf::from(arg)),
        }
    }
    let image_path = image_path.context("使い方: classify_image <image> [--config <config.json>]")?;

    let config = AppConfig::load_or_default(&config_path);
    let pipeline = ClassificationPipeline::from_config(&config)
        .with_context(|| format!("モデルの読み込みに失敗しました: {}", config.model.model_path))?;

    let upload = UploadedImage::from_path(&image_path, pipeline.upload_settings())
        .with_context(|| format!("画像を読み込めませんでした: {}", image_path.display()))?;

    match pipeline.classify_with_timeout(&upload).await {
        Ok(result) => {
            println!("{}", result.prediction);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e.user_message());
            Err(e.into())
        }
    }
}
