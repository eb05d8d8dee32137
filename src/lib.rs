pub mod bus;
pub mod cli;
pub mod commands;
pub mod config;
pub mod doctor;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod pr;
pub mod profiles;
pub mod qa;
pub mod report;
pub mod status;
pub mod supervisor;
pub mod telemetry;
pub mod vcs;
pub mod worker;

#[cfg(test)]
mod tests;
