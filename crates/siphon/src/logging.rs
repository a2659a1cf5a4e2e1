use tracing_subscriber::EnvFilter;

/// Environment variable holding a `tracing` filter directive.
pub const LOG_ENV: &str = "SIPHON_LOG";

fn default_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "siphon=info,siphon_ingest=info,siphon_store=info,siphon_archive=info",
        2 => "siphon=debug,siphon_ingest=debug,siphon_store=debug,siphon_archive=debug,warn",
        _ => "trace",
    }
}

/// Logs go to stderr so stdout carries only the summary.
pub fn init(verbose: u8) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_widens_the_default_filter() {
        assert_eq!(default_directive(0), "warn");
        assert!(default_directive(1).contains("siphon_ingest=info"));
        assert!(default_directive(2).contains("siphon_ingest=debug"));
        assert_eq!(default_directive(9), "trace");
    }
}
