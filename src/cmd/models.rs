//! `aicoder models`.

use aicoder::config::Config;

pub fn cmd_models(config: &Config) {
    let models = config.available_models();
    if models.is_empty() {
        println!();
        println!("No models configured. Set OPEN_AI_KEY and OPEN_AI_MODEL, or OLLAMA_MODEL.");
        println!();
        return;
    }

    println!("{:<10} Model", "Provider");
    println!("{:<10} -----", "--------");
    for model in models {
        println!("{:<10} {}", model.provider, model.id);
    }
}
