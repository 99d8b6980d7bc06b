//! ONNXモデルをメタデータ付きのtar.gzバンドルにまとめるツール
//!
//! 使い方: pack_model <model.onnx> <output.tar.gz> [model_name] [input_name] [output_name] [quantization]

use anyhow::{Context, Result};
use retina_classifier_lib::model::{save_bundle, ModelMetadata};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const USAGE: &str =
    "使い方: pack_model <model.onnx> <output.tar.gz> [model_name] [input_name] [output_name] [quantization]";

/// 3番目以降の引数からメタデータを作成
///
/// 量子化方式はエクスポート時の情報なので指定された場合だけ記録する。
fn bundle_metadata(args: &[String]) -> ModelMetadata {
    let model_name = args.get(3).map(String::as_str).unwrap_or("mobilenetv2_eye_disease");
    let input_name = args.get(4).map(String::as_str).unwrap_or("input");
    let output_name = args.get(5).map(String::as_str).unwrap_or("output");

    let mut metadata = ModelMetadata::v1(model_name, input_name, output_name);
    metadata.quantization = args.get(6).cloned();
    metadata
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        anyhow::bail!(USAGE);
    }

    let model_path = PathBuf::from(&args[1]);
    let output_path = PathBuf::from(&args[2]);

    let model_bytes = std::fs::read(&model_path)
        .with_context(|| format!("モデルファイルを読み込めませんでした: {}", model_path.display()))?;

    let metadata = bundle_metadata(&args);
    metadata
        .validate(&output_path)
        .context("メタデータの検証に失敗しました")?;

    let written = save_bundle(&output_path, &metadata, &model_bytes)?;
    tracing::info!(path = %written.display(), bytes = model_bytes.len(), "モデルバンドルを保存しました");
    Ok(())
}
