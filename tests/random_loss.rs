mod common;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use udprpc::{Call, CallError};

const CALL_COUNT: i64 = 30;
const LOSS_RATE: f64 = 0.2;

#[test]
fn replies_are_correct_under_loss() {
    common::init_logging();

    let server = common::spawn_server(common::fast_server_config(), common::arithmetic_registry());

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let relay = common::Relay::spawn(server.addr(), move |_, _| rng.gen_bool(LOSS_RATE));

    let mut client = udprpc::Client::connect_with_config(
        relay.addr(),
        udprpc::client::Config {
            ack_timeout_ms: 50,
            response_timeout_ms: 500,
            ..common::fast_client_config()
        },
    )
    .expect("failed to create udprpc client");

    let mut completed = 0;

    for i in 0..CALL_COUNT {
        match client.call(Call::new("add").arg(i).arg(i)) {
            Ok(reply) => {
                assert_eq!(reply.sequence, i as u64);
                assert_eq!(reply.result, Ok(json!(i * 2)));
                assert!(reply.attempts >= 1 && reply.attempts <= 5);

                completed += 1;
            }
            Err(CallError::DeliveryFailed { sequence, .. }) => {
                assert_eq!(sequence, i as u64);
            }
            Err(err) => panic!("unexpected error {}", err),
        }

        assert!(client.window_size() >= 1);
    }

    assert!(
        completed >= CALL_COUNT / 2,
        "only {} of {} calls completed",
        completed,
        CALL_COUNT
    );
}
