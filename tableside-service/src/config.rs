use std::{net::SocketAddr, path::PathBuf};

use chrono::Duration;
use clap::{ArgAction, Args, ValueEnum};

use crate::detector::DetectorConfig;
use crate::order::OrderPolicy;
use crate::session::SessionPolicy;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    Memory,
}

/// Session and order rules shared by every process role.
#[derive(Args, Clone, Debug)]
pub struct PolicyArgs {
    #[arg(
        long,
        env = "SESSION_TTL_MINUTES",
        default_value_t = 240,
        value_parser = clap::value_parser!(i64).range(1..)
    )]
    pub session_ttl_minutes: i64,

    #[arg(long, env = "MAX_DEVICES_PER_SESSION", default_value_t = 12)]
    pub max_devices_per_session: usize,

    /// Reject orders whose prices or total disagree with the catalog.
    #[arg(long, env = "VERIFY_CLIENT_TOTALS", default_value_t = true, action = ArgAction::Set)]
    pub verify_client_totals: bool,

    /// Compare quantities too when looking for duplicate orders.
    #[arg(long, env = "STRICT_DUPLICATES", default_value_t = false, action = ArgAction::Set)]
    pub strict_duplicates: bool,

    #[arg(
        long,
        env = "DEFAULT_COOKING_MINUTES",
        default_value_t = 15,
        value_parser = clap::value_parser!(i32).range(0..)
    )]
    pub default_cooking_minutes: i32,
}

impl PolicyArgs {
    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            ttl: Duration::minutes(self.session_ttl_minutes),
            max_devices: self.max_devices_per_session,
            ..SessionPolicy::default()
        }
    }

    pub fn order_policy(&self) -> OrderPolicy {
        OrderPolicy {
            verify_client_totals: self.verify_client_totals,
            default_cooking_minutes: self.default_cooking_minutes,
            detector: DetectorConfig {
                strict_duplicates: self.strict_duplicates,
                ..DetectorConfig::default()
            },
        }
    }
}

#[derive(Args, Clone, Debug)]
pub struct ApiArgs {
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8110")]
    pub bind_addr: SocketAddr,

    #[arg(long, env = "STORE", value_enum, default_value_t = StoreKind::Postgres)]
    pub store: StoreKind,

    #[arg(long, env = "DATABASE_URL", required_if_eq("store", "postgres"))]
    pub database_url: Option<String>,

    /// JSON file with tables and menu items for the memory store.
    #[arg(long, env = "SEED_FILE")]
    pub seed_file: Option<PathBuf>,

    /// Seconds between expiry sweeps run next to the API, 0 to disable.
    #[arg(long, env = "SWEEP_INTERVAL_SECONDS", default_value_t = 60)]
    pub sweep_interval_seconds: u64,

    #[command(flatten)]
    pub policy: PolicyArgs,
}

#[derive(Args, Clone, Debug)]
pub struct ProducerArgs {
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    #[arg(long, env = "KAFKA_URL")]
    pub kafka_url: String,
}

#[derive(Args, Clone, Debug)]
pub struct SweeperArgs {
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    #[arg(long, env = "SWEEP_INTERVAL_SECONDS", default_value_t = 60)]
    pub sweep_interval_seconds: u64,
}

#[derive(Args, Clone, Debug)]
pub struct MigrateArgs {
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        policy: PolicyArgs,
    }

    #[test]
    fn test_session_ttl_must_be_positive() {
        for ttl in ["0", "-30"] {
            let parsed = Cli::try_parse_from(["tableside", "--session-ttl-minutes", ttl]);
            assert!(parsed.is_err(), "ttl {ttl} was accepted");
        }

        let cli = Cli::try_parse_from(["tableside", "--session-ttl-minutes", "90"]).unwrap();
        assert_eq!(cli.policy.session_policy().ttl, Duration::minutes(90));
    }
}
