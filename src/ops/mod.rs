pub mod cli;
pub mod paths;
pub mod util;

mod acme;
mod context;
mod download;
mod links;
mod nginx;
mod platform;
mod preflight;
mod provision;
mod secrets;
mod service;
mod status;
mod xray;
