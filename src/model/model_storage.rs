//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（入出力記述子、ラベル表バージョンなど）
//! - model.onnx      - 量子化済みモデル

use anyhow::Context;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::error::{Result, RetinaError};
use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.onnx";

/// パスがtar.gzバンドルを指しているか
pub fn is_bundle_path(path: &Path) -> bool {
    path.extension().and_then(|s| s.to_str()) == Some("gz")
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> anyhow::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, data)
        .with_context(|| format!("Failed to add {} to tar", name))
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 保存先のパスを返します。
pub fn save_bundle(output_path: &Path, metadata: &ModelMetadata, model_bytes: &[u8]) -> anyhow::Result<PathBuf> {
    // output_pathがすでに.tar.gzで終わっている場合はそのまま、そうでなければ拡張子を追加
    let tar_gz_path = if is_bundle_path(output_path) {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    };

    if let Some(parent) = tar_gz_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
        }
    }

    let tar_gz_file = File::create(&tar_gz_path)
        .with_context(|| format!("Failed to create tar.gz file: {:?}", tar_gz_path))?;

    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_bytes)?;

    let encoder = tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?;
    encoder.finish().context("Failed to finalize gzip stream")?;

    Ok(tar_gz_path)
}

fn read_bundle(tar_gz_path: &Path, want_model: bool) -> anyhow::Result<(ModelMetadata, Option<Vec<u8>>)> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_opt: Option<Vec<u8>> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_path_buf();

        match path.to_str() {
            Some(METADATA_ENTRY) => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
            }
            Some(MODEL_ENTRY) if want_model => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_opt = Some(buffer);
            }
            _ => {}
        }

        if metadata_opt.is_some() && (!want_model || model_opt.is_some()) {
            break;
        }
    }

    let metadata = metadata_opt
        .ok_or_else(|| anyhow::anyhow!("{} not found in tar.gz archive", METADATA_ENTRY))?;
    if want_model && model_opt.is_none() {
        anyhow::bail!("{} not found in tar.gz archive", MODEL_ENTRY);
    }
    Ok((metadata, model_opt))
}

/// Tar.gzからモデルメタデータのみを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    read_bundle(tar_gz_path, false)
        .map(|(metadata, _)| metadata)
        .map_err(|e| RetinaError::model_load(tar_gz_path, format!("{:#}", e)))
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_bundle(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let (metadata, model) = read_bundle(tar_gz_path, true)
        .map_err(|e| RetinaError::model_load(tar_gz_path, format!("{:#}", e)))?;
    let model = model.ok_or_else(|| RetinaError::model_load(tar_gz_path, "model.onnx missing"))?;
    Ok((metadata, model))
}

/// メタデータの概要をログに出力
pub fn log_metadata_info(metadata: &ModelMetadata) {
    tracing::info!(
        model = %metadata.model_name,
        label_table_version = metadata.label_table_version,
        labels = %metadata.class_labels.join(", "),
        input = ?metadata.input.shape,
        output = ?metadata.output.shape,
        quantization = metadata.quantization.as_deref().unwrap_or("none"),
        exported_at = %metadata.exported_at,
        "モデルメタデータ"
    );
}
