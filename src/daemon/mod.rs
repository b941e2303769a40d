pub mod child;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod limiter;
pub mod metrics;
pub mod registrar;
pub mod supervisor;
pub mod web;

pub fn main() -> anyhow::Result<()> {
    cli::run()
}
