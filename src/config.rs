use std::fs;
use std::path::{Path, PathBuf};

/// Resolves a path relative to the config directory.
fn config_path(sub: &str) -> PathBuf {
    let base = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
    Path::new(&base).join(sub)
}

/// Initialize the config directory with defaults if missing.
pub fn init() {
    let base = config_path("");
    if !base.exists() {
        fs::create_dir_all(&base).expect("Failed to create config directory");
    }

    let prompts_path = config_path("prompts.json");
    if !prompts_path.exists() {
        let defaults = serde_json::json!([
            "a cat playing chess",
            "the last slice of pizza",
            "a robot learning to dance",
            "my neighbor's very loud lawnmower",
            "an octopus doing taxes",
        ]);
        fs::write(
            &prompts_path,
            serde_json::to_string_pretty(&defaults).unwrap(),
        )
        .expect("Failed to write default prompts.json");
    }
}

/// Load the prompt corpus used to seed the first round of each game.
/// Round content is otherwise opaque to the session core.
pub fn load_prompts() -> Vec<String> {
    let path = config_path("prompts.json");

    let data = match fs::read_to_string(&path) {
        Ok(data) => data,
        Err(e) => {
            tracing::error!("Failed to read {}: {}", path.display(), e);
            return vec![];
        }
    };

    match serde_json::from_str::<Vec<String>>(&data) {
        Ok(prompts) => prompts,
        Err(e) => {
            tracing::error!("Failed to parse {}: {}", path.display(), e);
            vec![]
        }
    }
}
