pub mod decoder;
pub mod preprocess;
pub mod inference;
pub mod interpreter;

pub use decoder::decode;
pub use preprocess::{prepare, PreparedImage};
pub use inference::{ForwardPass, InferenceEngine, ModelArtifact};
#[cfg(feature = "ml")]
pub use inference::{OrtRuntime, RuntimeTensor};
pub use interpreter::{check_distribution, interpret};
