//! Reference worker used by the integration tests and for manual smoke runs.
//!
//! Serves a fixed set of handlers over the pipes named in the launch
//! environment:
//! - `echo`: returns the request payload unchanged
//! - `uppercase`: upper-cases `text`
//! - `sleep`: waits `ms` milliseconds
//! - `fail`: answers with a handler error
//! - `crash`: exits the process immediately
//! - `env`: reports the environment variables named in `keys`

use clap::Parser;
use modelserve::worker::{HandlerTable, WorkerRuntime};
use modelserve::{Error, Payload, Result};
use serde_json::{json, Value};
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "modelserve-echo-worker")]
#[command(version, about = "Echo worker speaking the modelserve pipe protocol", long_about = None)]
struct Cli {
    /// Delay before announcing readiness, simulating model load time.
    #[arg(long, env = "ECHO_SETUP_DELAY_MS", default_value_t = 0)]
    setup_delay_ms: u64,

    /// Fail the setup step instead of announcing readiness.
    #[arg(long)]
    fail_setup: bool,
}

fn handler_error(handler: &str, message: impl Into<String>) -> Error {
    Error::Handler {
        handler: handler.to_string(),
        message: message.into(),
        payload: Payload::new(),
    }
}

fn crash(code: i32) -> Result<Payload> {
    tracing::error!(code, "crashing on request");
    std::process::exit(code)
}

fn handlers() -> Result<HandlerTable> {
    HandlerTable::builder()
        .handler("echo", |payload| async move { Ok(payload) })
        .handler("uppercase", |payload: Payload| async move {
            let text = payload
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| handler_error("uppercase", "missing string field 'text'"))?;
            let mut reply = Payload::new();
            reply.insert("text".to_string(), json!(text.to_uppercase()));
            Ok::<_, Error>(reply)
        })
        .handler("sleep", |payload: Payload| async move {
            let ms = payload.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            let mut reply = Payload::new();
            reply.insert("slept_ms".to_string(), json!(ms));
            Ok(reply)
        })
        .handler("fail", |payload: Payload| async move {
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("requested failure")
                .to_string();
            Err::<Payload, _>(Error::Handler {
                handler: "fail".to_string(),
                message,
                payload,
            })
        })
        .handler("env", |payload: Payload| async move {
            let mut reply = Payload::new();
            let keys = payload.get("keys").and_then(Value::as_array).cloned();
            for key in keys.unwrap_or_default().iter().filter_map(Value::as_str) {
                let value = std::env::var(key).map(Value::String).unwrap_or(Value::Null);
                reply.insert(key.to_string(), value);
            }
            Ok(reply)
        })
        .handler("crash", |payload: Payload| async move {
            let code = payload.get("code").and_then(Value::as_i64).unwrap_or(3) as i32;
            crash(code)
        })
        .build()
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    modelserve::observability::init_tracing();

    let runtime = match handlers().and_then(WorkerRuntime::from_env) {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "echo worker cannot start");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime
        .run(|| async move {
            if cli.setup_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(cli.setup_delay_ms)).await;
            }
            if cli.fail_setup {
                return Err(Error::startup("setup failed on request (--fail-setup)"));
            }
            Ok(())
        })
        .await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "echo worker exited with error");
            ExitCode::FAILURE
        }
    }
}
