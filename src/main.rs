// src/main.rs
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use varan::{Handler, Outcome, Server, ServerConfig, Task, logging};

#[derive(Parser)]
#[command(name = "varan")]
#[command(about = "Event-driven HTTP server front end with easy/hard worker pools")]
#[command(version)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: PathBuf,
}

/// Built-in handler used when no application module is linked in:
/// greets on the easy pool and demonstrates escalation for paths under
/// /hard.
struct DemoHandler;

impl Handler for DemoHandler {
    fn handle_easy(&self, task: &mut dyn Task) -> Outcome {
        if task.uri_path().starts_with("/hard") {
            return Outcome::Hard;
        }

        task.set_response_status(200);
        task.set_response_header("Content-type", "text/plain");
        let body = format!("varan demo: {} {}\n", task.uri_path(), task.uri_params());
        task.append_response_body(body.as_bytes());
        Outcome::Success
    }

    fn handle_hard(&self, task: &mut dyn Task) -> Outcome {
        task.set_response_status(200);
        task.set_response_header("Content-type", "text/plain");
        let body = format!("varan demo (hard pool): {}\n", task.uri_path());
        task.append_response_body(body.as_bytes());
        Outcome::Success
    }

    fn version_string(&self) -> &str {
        "demo/0.1"
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match ServerConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("varan: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let log_file = match logging::init(&config.log_level, config.log_file.as_deref()) {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("varan: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let server = match Server::new(config, Arc::new(DemoHandler)) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let server = match log_file {
        Some(file) => server.with_log_file(file),
        None => server,
    };

    let handle = server.shutdown_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::warn!("termination signal received");
        handle.shutdown();
    }) {
        tracing::error!("cannot install signal handler: {}", e);
        return ExitCode::FAILURE;
    }

    match server.serve() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("server failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
