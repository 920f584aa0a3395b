pub mod app_error;
pub mod cli;
pub mod config;
pub mod error;
pub mod format;
pub mod gate;
pub mod job;
pub mod model;
pub mod operation;
pub mod orchestrator;
pub mod output;
pub mod path_guard;
pub mod registry;
pub mod runner;
pub mod service;
pub mod version;

pub async fn run() -> i32 {
    match cli::run_cli().await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{err}");
            err.code()
        }
    }
}
