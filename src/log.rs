//! Tracing setup shared by the binaries.
//!
//! `RUST_LOG` takes precedence. Without it this crate logs at debug and everything else at info,
//! with the database and HTTP crates held back to warnings. Logs go to stderr, stdout carries
//! command output.

use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

use crate::env::ENV_CONFIG;

const DEFAULT_DIRECTIVES: &str = "info,testnet_genesis=debug,sqlx=warn,hyper=warn,reqwest=warn";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

pub fn init() {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr);

    let builder = if ENV_CONFIG.log_perf {
        builder.with_span_events(FmtSpan::CLOSE)
    } else {
        builder
    };

    if ENV_CONFIG.log_json {
        builder.json().flatten_event(true).init();
    } else {
        builder.init();
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_parse_test() {
        let filter = EnvFilter::try_new(DEFAULT_DIRECTIVES).unwrap();
        let rendered = filter.to_string();
        assert!(rendered.contains("testnet_genesis=debug"));
        assert!(rendered.contains("sqlx=warn"));
    }
}
