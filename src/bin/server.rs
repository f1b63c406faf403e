use clap::Parser;
use serde_json::Value;

use udprpc::{AckPolicy, Args, HandlerError, MethodRegistry};

/// Serves demo arithmetic functions over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Local address to bind.
    #[arg(short, long, env = "UDPRPC_BIND", default_value = "127.0.0.1:8888")]
    bind: String,

    /// Time to wait for a response acknowledgment before resending, in milliseconds.
    #[arg(long, env = "UDPRPC_ACK_TIMEOUT_MS", default_value_t = 1000)]
    ack_timeout_ms: u64,

    /// Number of sends before a response is given up on.
    #[arg(long, env = "UDPRPC_MAX_RETRIES", default_value_t = 5)]
    max_retries: u32,

    /// Acknowledge every Nth request of a client. 1 acknowledges every request.
    #[arg(long, env = "UDPRPC_ACK_BATCH", default_value_t = 1)]
    ack_batch: u32,

    /// Do not resend responses until they are acknowledged.
    #[arg(long, env = "UDPRPC_NO_RESPONSE_ACK")]
    no_response_ack: bool,

    /// Per-client buffer hint ceiling, in bytes.
    #[arg(long, env = "UDPRPC_MAX_BUFFER_SIZE", default_value_t = 4096)]
    max_buffer_size: usize,
}

fn binary_op(args: &Args, op: fn(f64, f64) -> f64) -> Result<Value, HandlerError> {
    args.expect_arity(2)?;

    let a: Value = args.arg(0)?;
    let b: Value = args.arg(1)?;

    // Integers stay integers
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        let result = op(a as f64, b as f64);
        if result.fract() == 0.0 && result.abs() < i64::MAX as f64 {
            return Ok(Value::from(result as i64));
        }
    }

    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => Ok(Value::from(op(a, b))),
        _ => Err(HandlerError::new("arguments must be numbers")),
    }
}

fn registry() -> MethodRegistry {
    let mut registry = MethodRegistry::new();

    let functions: [(&str, fn(f64, f64) -> f64); 3] = [
        ("add", |a, b| a + b),
        ("subtract", |a, b| a - b),
        ("multiply", |a, b| a * b),
    ];

    for (name, op) in functions {
        if let Err(err) = registry.register(name, move |args: &Args| binary_op(args, op)) {
            log::warn!("{}", err);
        }
    }

    registry
}

fn main() {
    env_logger::builder().format_timestamp_millis().init();

    let cli = Cli::parse();

    let config = udprpc::server::Config {
        ack_timeout_ms: cli.ack_timeout_ms,
        max_retries: cli.max_retries,
        ack_policy: AckPolicy::from_batch(cli.ack_batch),
        response_ack: !cli.no_response_ack,
        max_buffer_size: cli.max_buffer_size,
        ..Default::default()
    };

    let mut server = match udprpc::Server::bind_with_config(&cli.bind, registry(), config) {
        Ok(server) => server,
        Err(err) => {
            log::error!("failed to bind {}: {}", cli.bind, err);
            std::process::exit(1);
        }
    };

    if let Err(err) = server.serve() {
        log::error!("server failed: {}", err);
        std::process::exit(1);
    }
}
