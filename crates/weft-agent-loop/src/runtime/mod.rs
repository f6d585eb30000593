pub mod dispatcher;
pub mod run_context;
pub mod step_runner;
pub mod streaming;
pub mod transcript;
