use clap::Parser;
use serde_json::Value;

use udprpc::{AckPolicy, Call, CallError};

/// Calls a function on a udprpc server and prints the result.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Server address.
    #[arg(short, long, env = "UDPRPC_SERVER", default_value = "127.0.0.1:8888")]
    server: String,

    /// Time to wait for an acknowledgment before resending, in milliseconds.
    #[arg(long, env = "UDPRPC_ACK_TIMEOUT_MS", default_value_t = 1000)]
    ack_timeout_ms: u64,

    /// Number of sends before the call fails.
    #[arg(long, env = "UDPRPC_MAX_RETRIES", default_value_t = 5)]
    max_retries: u32,

    /// Time to wait for a response once acknowledged, in milliseconds.
    #[arg(long, env = "UDPRPC_RESPONSE_TIMEOUT_MS", default_value_t = 5000)]
    response_timeout_ms: u64,

    /// The server acknowledges every Nth request. Anything above 1 pipelines calls.
    #[arg(long, env = "UDPRPC_ACK_BATCH", default_value_t = 1)]
    ack_batch: u32,

    /// Number of times to repeat the call.
    #[arg(short, long, default_value_t = 1)]
    count: u32,

    /// Function to call.
    function: String,

    /// Positional arguments as JSON values. Anything that is not valid JSON is sent as a string.
    args: Vec<String>,
}

fn parse_arg(arg: &str) -> Value {
    serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.to_string()))
}

fn main() {
    env_logger::builder().format_timestamp_millis().init();

    let cli = Cli::parse();

    let config = udprpc::client::Config {
        ack_timeout_ms: cli.ack_timeout_ms,
        max_retries: cli.max_retries,
        response_timeout_ms: cli.response_timeout_ms,
        ack_policy: AckPolicy::from_batch(cli.ack_batch),
        ..Default::default()
    };

    let mut client = match udprpc::Client::connect_with_config(&cli.server, config) {
        Ok(client) => client,
        Err(err) => {
            log::error!("failed to connect to {}: {}", cli.server, err);
            std::process::exit(1);
        }
    };

    let args: Vec<Value> = cli.args.iter().map(|arg| parse_arg(arg)).collect();

    let mut failed = false;

    for _ in 0..cli.count {
        let call = Call::new(cli.function.clone()).args(args.clone());

        match client.call(call) {
            Ok(reply) => match reply.result {
                Ok(value) => println!(
                    "[{}] {} ({} attempts, {} ms)",
                    reply.sequence,
                    value,
                    reply.attempts,
                    reply.elapsed.as_millis()
                ),
                Err(err) => {
                    println!("[{}] error: {}", reply.sequence, err);
                    failed = true;
                }
            },
            Err(err @ CallError::DeliveryFailed { .. }) => {
                println!("{}", err);
                failed = true;
            }
            Err(err) => {
                log::error!("{}", err);
                std::process::exit(1);
            }
        }
    }

    if failed {
        std::process::exit(2);
    }
}
