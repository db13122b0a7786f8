//! Log initialization shared by the server binary and tests.

use std::sync::Once;

use colored::Color::{Green, Red, Yellow};
use logforth::filter::EnvFilter;
use logforth::layout::TextLayout;

static INIT: Once = Once::new();

/// Dependency modules whose debug output drowns the request log; clamped to
/// warn unless RUST_LOG names them explicitly.
const CLAMPED_MODULES: [&str; 5] = ["h2", "hyper", "hyper_util", "axum", "tower"];

fn default_filter(level: &str) -> String {
    let mut filter = level.to_string();
    for module in CLAMPED_MODULES {
        filter.push_str(&format!(",{module}=warn"));
    }
    filter
}

/// Initialize colored stderr logging at `level`. Idempotent; RUST_LOG takes
/// precedence when set.
pub fn init(level: &str) {
    init_inner(level, true);
}

/// Plain (uncolored) variant for test output.
pub fn init_for_tests() {
    init_inner("info", false);
}

fn init_inner(level: &str, colored: bool) {
    let filter_str = default_filter(level);
    INIT.call_once(move || {
        let filter = EnvFilter::from_env_or("RUST_LOG", filter_str);
        let builder = logforth::builder();
        if colored {
            let layout = TextLayout::default()
                .info_color(Green)
                .warn_color(Yellow)
                .error_color(Red);
            builder
                .dispatch(|d| {
                    d.filter(filter)
                        .append(logforth::append::Stderr::default().with_layout(layout))
                })
                .apply();
        } else {
            builder
                .dispatch(|d| d.filter(filter).append(logforth::append::Stderr::default()))
                .apply();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_clamps_noisy_modules() {
        let filter = default_filter("debug");
        assert!(filter.starts_with("debug,"));
        assert!(filter.contains("hyper=warn"));
        assert!(filter.contains("axum=warn"));
    }
}
