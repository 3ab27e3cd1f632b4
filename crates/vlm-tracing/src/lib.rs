use dotenvy::dotenv;
use std::{path::PathBuf, sync::Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info";

fn init_env_layer() -> tracing_subscriber::EnvFilter {
    // must run before the filter is built so RUST_LOG in .env is honoured
    match dotenv() {
        Ok(path) => eprintln!(".env read successfully from {}", path.display()),
        Err(e) => eprintln!("Could not load .env file: {e}"),
    };

    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_FILTER.into())
}

pub fn init_tracing_to_stderr() {
    let env_layer = init_env_layer();

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true);

    tracing_subscriber::registry()
        .with(env_layer)
        .with(stderr_layer)
        .init();
}

pub fn init_tracing_to_file(log_dir: PathBuf) {
    let env_layer = init_env_layer();

    let file_log_layer = {
        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            eprintln!("Failed to create log dir: {}", e);
            init_tracing_to_stderr(); // fallback to stderr tracing
            return;
        }
        let file = match std::fs::File::create(log_dir.join("vlm.log")) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("Failed to create log file: {}", e);
                init_tracing_to_stderr(); // fallback to stderr tracing
                return;
            }
        };
        tracing_subscriber::fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
    };

    tracing_subscriber::registry()
        .with(env_layer)
        .with(file_log_layer)
        .init();

    tracing::info!("logging to {}", log_dir.join("vlm.log").display());
}
