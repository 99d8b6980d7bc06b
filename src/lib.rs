//! 眼底画像の疾患分類
//!
//! 1枚の眼底画像をデコード・前処理し、量子化済みモデルで推論して
//! 疾患クラスと信頼度を返します。

pub mod error;
pub mod types;
pub mod upload;
pub mod model;
pub mod ml;
pub mod pipeline;

pub use error::{Result, RetinaError, Severity};
pub use pipeline::{ClassificationPipeline, ClassificationResult};
pub use types::{BatchTensor, OutputVector, PixelGrid, Prediction, RetinalClass};
pub use upload::{DeclaredFormat, UploadedImage};
