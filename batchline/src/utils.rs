pub mod model_dir;

pub use model_dir::{
    find_model_files, load_model_config, select_model_file, ModelFile, MODEL_CONFIG_FILE,
    TOKENIZER_FILE,
};
