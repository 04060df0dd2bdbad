//! Model file utilities that run outside any session.

use std::path::{Path, PathBuf};

use llama_engine::{ModelFileType, ModelInspector, ModelType, Quantizer};
use tracing::{info, warn};

use crate::error::{Result, SessionError};

/// Quantize `source` into `destination` at `file_type`.
pub fn quantize_model(
    quantizer: &dyn Quantizer,
    source: &Path,
    destination: &Path,
    file_type: ModelFileType,
) -> Result<()> {
    info!(
        source = %source.display(),
        destination = %destination.display(),
        %file_type,
        "quantizing model"
    );
    quantizer
        .quantize(source, destination, file_type)
        .map_err(|e| {
            warn!(error = %e, "quantization failed");
            SessionError::FailedToQuantize(e)
        })
}

/// Read the parameter-count class of the model at `path`.
pub fn model_type(inspector: &dyn ModelInspector, path: &Path) -> Result<ModelType> {
    inspector
        .inspect(path)
        .map_err(SessionError::FailedToLoadModel)
}

/// Check that `path` holds a model of a known size.
pub fn validate_model(inspector: &dyn ModelInspector, path: &Path) -> Result<ModelType> {
    match inspector.inspect(path) {
        Ok(ModelType::Unknown) => Err(SessionError::FailedToValidateModel(format!(
            "{} is not a recognised model size",
            path.display()
        ))),
        Ok(model_type) => Ok(model_type),
        Err(e) => Err(SessionError::FailedToValidateModel(e.to_string())),
    }
}

/// Files a PyTorch checkpoint directory must hold before it can be converted
/// to ggml: `params.json`, one `consolidated.NN.pth` per shard, and the
/// shared `tokenizer.model` one level up.
pub fn conversion_inputs(model_type: ModelType, dir: &Path) -> Vec<PathBuf> {
    let mut files = vec![dir.join("params.json")];
    files.extend(
        (0..model_type.pytorch_part_count()).map(|i| dir.join(format!("consolidated.{i:02}.pth"))),
    );
    files.push(dir.join("..").join("tokenizer.model"));
    files
}

/// Check that `dir` holds everything needed to convert a `model_type`
/// checkpoint, reporting every missing file at once.
pub fn validate_conversion_dir(model_type: ModelType, dir: &Path) -> Result<()> {
    if model_type == ModelType::Unknown {
        return Err(SessionError::FailedToValidateModel(
            "cannot convert a model of unknown size".into(),
        ));
    }

    let missing: Vec<PathBuf> = conversion_inputs(model_type, dir)
        .into_iter()
        .filter(|path| !path.is_file())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    warn!(dir = %dir.display(), missing = missing.len(), "conversion inputs missing");
    Err(SessionError::MissingModelFiles(missing))
}
