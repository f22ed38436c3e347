use tracing_subscriber::EnvFilter;

/// `RUST_LOG` when it is set and parses, otherwise `default_directives`.
pub fn env_filter(default_directives: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives))
}
