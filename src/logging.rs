use tracing::Level;

pub const LOG_ENV: &str = "ARTS_LOG";

fn level_from_env() -> Level {
    std::env::var(LOG_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<Level>().ok())
        .unwrap_or(Level::INFO)
}

pub fn init() {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level_from_env())
        .with_thread_names(true)
        .finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("logging already initialized: {err}");
    }
}
