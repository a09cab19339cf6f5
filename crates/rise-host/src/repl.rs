//! A minimal line-oriented REPL driving [`Engine::dispatch_turn`], standing
//! in for the assistant front end this host is built to sit behind. Each
//! stdin line is one user turn:
//!
//! - `/call <function> <json-arguments>` always resolves via the function
//!   catalogue, bypassing any owned session — useful to kick off a
//!   passthrough plugin by name.
//! - anything else is handed to [`Engine::dispatch_turn`] verbatim, which
//!   routes it as `input` to the session owner if one exists, or tries to
//!   resolve it as a bare function name with no arguments otherwise.

use std::sync::Arc;

use rise_engine::{Dispatch, Engine, EngineError};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};

pub async fn run(engine: Arc<Engine>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("rise-host ready. Type a plugin turn, or `/call <function> <json>`. Ctrl-C to quit.");

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let dispatch = if let Some(rest) = line.strip_prefix("/call ") {
            dispatch_call(&engine, rest).await
        } else {
            // No owned session: the whole line is taken as a bare function
            // name with no arguments. An owned session ignores this and
            // routes `line` to the owner as `input` verbatim instead.
            let bare_function = line.split_whitespace().next();
            engine.dispatch_turn(bare_function, Value::Null, line).await
        };

        match dispatch {
            Ok(Dispatch { plugin, mut handle }) => {
                while let Some(chunk) = handle.stream.recv().await {
                    println!("[{plugin}] stream: {chunk}");
                }
                match handle.result.await {
                    Ok(outcome) => {
                        print_outcome(&plugin, &outcome);
                        engine.record_dispatch_outcome(&plugin, &outcome).await;
                    }
                    Err(_) => println!("[{plugin}] dispatch handle dropped without a terminal notification"),
                }
            }
            Err(e) => print_dispatch_error(&e),
        }
    }

    Ok(())
}

async fn dispatch_call(engine: &Arc<Engine>, rest: &str) -> Result<Dispatch, EngineError> {
    let (function, raw_args) = rest.split_once(' ').unwrap_or((rest, "{}"));
    let arguments: Value = serde_json::from_str(raw_args).unwrap_or(Value::Null);
    engine.dispatch_turn(Some(function), arguments, rest).await
}

fn print_outcome(plugin: &str, outcome: &rise_engine::DispatchOutcome) {
    match outcome {
        rise_engine::DispatchOutcome::Complete { success, data, keep_session } => {
            println!("[{plugin}] complete success={success} keep_session={keep_session} data={data}");
        }
        rise_engine::DispatchOutcome::Error { code, message } => {
            println!("[{plugin}] error code={code} message={message}");
        }
    }
}

fn print_dispatch_error(e: &EngineError) {
    match e {
        EngineError::UnknownFunction(name) => println!("error: unknown function `{name}`"),
        EngineError::MissingFunction => println!("error: no owned session and no `/call <function>` given"),
        EngineError::PluginNotRunning(name) => println!("error: plugin `{name}` is not running"),
        other => println!("error: {other}"),
    }
}
