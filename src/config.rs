//! Server configuration, from CLI flags with environment overrides.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::registry::CapacityPolicy;

#[derive(Parser)]
#[command(name = "genserve", about = "Token-streaming HTML generation demo server")]
pub struct Args {
    /// Port to listen on
    #[arg(long, env = "GENSERVE_PORT", default_value_t = 7860)]
    pub port: u16,

    /// Maximum number of generations running at once
    #[arg(long, env = "GENSERVE_MAX_CONCURRENT", default_value_t = 1)]
    pub max_concurrent: usize,

    /// Seconds before an in-flight generation is forcibly ended
    #[arg(long, env = "GENSERVE_TIMEOUT_IN_SEC", default_value_t = 600)]
    pub timeout_in_sec: u64,

    /// What to do with a new request when all slots are busy
    #[arg(long, env = "GENSERVE_ON_CAPACITY", value_enum, default_value = "reject")]
    pub on_capacity: CapacityPolicy,

    /// Directory of static assets served alongside the generator
    #[arg(long, env = "GENSERVE_STATIC_DIR", default_value = "public")]
    pub static_dir: PathBuf,

    /// Per-token delay of the built-in echo engine, in milliseconds
    #[arg(long, env = "GENSERVE_TOKEN_DELAY_MS", default_value_t = 80)]
    pub token_delay_ms: u64,
}

/// The subset of [`Args`] the request path needs, passed by value into the
/// router state.
#[derive(Clone, Copy, Debug)]
pub struct ServerConfig {
    pub max_concurrent: usize,
    pub timeout: Duration,
    pub on_capacity: CapacityPolicy,
}

impl ServerConfig {
    pub fn from_args(args: &Args) -> Self {
        Self {
            max_concurrent: args.max_concurrent,
            timeout: Duration::from_secs(args.timeout_in_sec),
            on_capacity: args.on_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_demo_deployment() {
        let args = Args::parse_from(["genserve"]);
        assert_eq!(args.port, 7860);
        assert_eq!(args.max_concurrent, 1);
        assert_eq!(args.timeout_in_sec, 600);
        assert_eq!(args.on_capacity, CapacityPolicy::Reject);
    }

    #[test]
    fn capacity_policy_is_selectable() {
        let args = Args::parse_from(["genserve", "--on-capacity", "evict-oldest"]);
        assert_eq!(args.on_capacity, CapacityPolicy::EvictOldest);
    }
}
