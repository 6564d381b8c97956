pub mod loader;

pub use loader::{
    CONFIG_FILE, WEIGHTS_FILE, init_model, load_config, load_config_for_model,
    load_external_model, load_model_with_config, save_tensors, save_varmap,
};
