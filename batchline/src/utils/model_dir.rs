use crate::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const MODEL_CONFIG_FILE: &str = "config.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// A model file discovered inside a model directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFile {
    pub dir: PathBuf,
    pub filename: String,
}

impl ModelFile {
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.filename)
    }
}

/// Loads the model configuration from the provided file path.
///
/// # Arguments
///
/// * `file_path` - The path to the `config.json` file containing the model configuration.
///
/// # Returns
///
/// The loaded model configuration.
pub fn load_model_config(file_path: PathBuf) -> Result<serde_json::Value> {
    let model_config = fs::read_to_string(file_path)?;
    let model_config = serde_json::from_str(&model_config)?;
    Ok(model_config)
}

/// Recursively collects the files under `path` with the given extension, sorted by path.
pub fn find_model_files(path: &Path, extension: &str) -> Result<Vec<ModelFile>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let matches = entry
            .path()
            .extension()
            .map_or(false, |ext| ext == extension);
        if !matches {
            continue;
        }
        let dir = entry
            .path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| path.to_path_buf());
        files.push(ModelFile {
            dir,
            filename: entry.file_name().to_string_lossy().into_owned(),
        });
    }
    Ok(files)
}

/// Picks the model file a pipeline should load.
///
/// A single candidate is always used. With several candidates `filename` is required and has
/// to match the file name of one of them.
///
/// # Arguments
///
/// * `pipeline` - The name of the pipeline, used in error messages.
/// * `path` - The model directory.
/// * `extension` - The extension of the model files, without the leading dot.
/// * `filename` - Optional file name selecting one of several model files.
///
/// # Returns
///
/// The path of the selected model file.
pub fn select_model_file(
    pipeline: &str,
    path: &Path,
    extension: &str,
    filename: Option<&str>,
) -> Result<PathBuf> {
    let candidates = find_model_files(path, extension)?;
    match candidates.as_slice() {
        [] => Err(Error::ModelFileNotFound {
            pipeline: pipeline.to_string(),
            path: path.to_path_buf(),
            extension: extension.to_string(),
        }),
        [single] => {
            if let Some(filename) = filename {
                if single.filename != filename {
                    tracing::warn!(
                        "Pipeline '{}': requested model file '{}' but only '{}' exists, using it",
                        pipeline,
                        filename,
                        single.filename
                    );
                }
            }
            Ok(single.path())
        }
        _ => {
            let filename = filename.ok_or_else(|| Error::AmbiguousModelFile {
                pipeline: pipeline.to_string(),
                path: path.to_path_buf(),
                extension: extension.to_string(),
            })?;
            candidates
                .iter()
                .find(|candidate| candidate.filename == filename)
                .map(ModelFile::path)
                .ok_or_else(|| Error::ModelFileNotMatched {
                    pipeline: pipeline.to_string(),
                    path: path.to_path_buf(),
                    filename: filename.to_string(),
                })
        }
    }
}
