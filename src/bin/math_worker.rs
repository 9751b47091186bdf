//! Arithmetic demo worker, also exercised by the integration tests.

use plugmux::worker::Worker;
use serde_json::{json, Map, Value};
use std::time::Duration;

fn number(params: &Map<String, Value>, key: &str) -> Result<f64, String> {
    params
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| format!("missing numeric parameter '{key}'"))
}

#[tokio::main]
async fn main() -> plugmux::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut worker = Worker::new();

    worker.register("add", |params| async move {
        Ok(json!(number(&params, "a")? + number(&params, "b")?))
    })?;

    worker.register("subtract", |params| async move {
        Ok(json!(number(&params, "a")? - number(&params, "b")?))
    })?;

    worker.register("multiply", |params| async move {
        Ok(json!(number(&params, "a")? * number(&params, "b")?))
    })?;

    worker.register("divide", |params| async move {
        let a = number(&params, "a")?;
        let b = number(&params, "b")?;
        if b == 0.0 {
            return Err("divide by zero".to_string());
        }
        Ok(json!(a / b))
    })?;

    worker.register("echo", |params| async move { Ok(Value::Object(params)) })?;

    worker.register("sleep_ms", |params| async move {
        let ms = number(&params, "ms")? as u64;
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!(ms))
    })?;

    worker.serve().await
}
