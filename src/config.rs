//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `MILLRACE_DATABASE_URL`: PostgreSQL connection string (required for the
//!   Postgres store)
//! - `MILLRACE_INCREMENTAL_SYNC_LIMIT`: incremental ledger syncs before a
//!   forced full reload (default: 50)
//! - `MILLRACE_STEP_BUDGET`: max nodes issued per drain (default: 128)
//! - `MILLRACE_PLAN_ITERATION_LIMIT`: max firings of one node per planning
//!   pass (default: 32)
//! - `MILLRACE_DEBUG`: forward verbose diagnostics to node hooks
//!   (default: false)

use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};

use crate::ledger::LedgerConfig;
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL.
    pub database_url: Option<String>,
    pub ledger: LedgerConfig,
    pub scheduler: SchedulerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("MILLRACE_DATABASE_URL").ok();

        let ledger = LedgerConfig {
            incremental_sync_limit: parse_env(
                "MILLRACE_INCREMENTAL_SYNC_LIMIT",
                LedgerConfig::default().incremental_sync_limit,
            )?,
        };

        let defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            step_budget: parse_env("MILLRACE_STEP_BUDGET", defaults.step_budget)?,
            plan_iteration_limit: parse_env(
                "MILLRACE_PLAN_ITERATION_LIMIT",
                defaults.plan_iteration_limit,
            )?,
            debugging: parse_env("MILLRACE_DEBUG", false)?,
        };

        Ok(Self {
            database_url,
            ledger,
            scheduler,
        })
    }

    /// The database URL, or an error naming the variable that is missing.
    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("MILLRACE_DATABASE_URL is not set")
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}
