//! End-to-end cascade tests driven entirely through the public crate API,
//! complementing the component-level unit tests inside `src/`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use neurobus::{Axon, Cns, Collateral, Dendrite, FacadeOptions, Neuron, ReactionOutput, StimulationOptions};

/// Every stimulation tags its internal logs with a `stimulation_id` span;
/// wiring a subscriber here is how a caller would actually see them
/// correlated per cascade. `try_init` so repeated test binaries in the same
/// process don't panic on a second global-subscriber install.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn accumulating_chain() -> (Cns, Collateral<u32>) {
    let x = Collateral::<u32>::new("x");
    let y = Collateral::<u32>::new("y");
    let a = Neuron::new("A", Axon::builder().with("x", &x).build()).build();
    let y2 = y.clone();
    let b = Neuron::new("B", Axon::builder().with("y", &y).build())
        .dendrite(Dendrite::sync(&x, move |p, _axon, ctx| {
            ctx.set(Arc::new(*p));
            Ok(ReactionOutput::One(y2.create_signal(*p * 2)))
        }))
        .build();
    let cns = Cns::new(vec![a, b], FacadeOptions::default()).unwrap();
    (cns, x)
}

#[tokio::test]
async fn replaying_a_captured_seed_reaches_the_same_terminal_context() {
    init_tracing();
    let (cns, x) = accumulating_chain();

    let first = cns.stimulate(vec![x.create_signal(7)], StimulationOptions::default());
    first.wait_until_complete().await.unwrap();
    let first_snapshot = first.get_context().snapshot();

    let (cns2, x2) = accumulating_chain();
    let second = cns2.stimulate(vec![x2.create_signal(7)], StimulationOptions::default());
    second.wait_until_complete().await.unwrap();
    let second_snapshot = second.get_context().snapshot();

    assert_eq!(first_snapshot.len(), second_snapshot.len());
    let a = *first_snapshot["B"].downcast_ref::<u32>().unwrap();
    let b = *second_snapshot["B"].downcast_ref::<u32>().unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn fan_out_queue_length_accounts_for_every_undispatched_peer() {
    let x = Collateral::<u32>::new("x");
    let seen_lengths = Arc::new(std::sync::Mutex::new(Vec::new()));

    let mut neurons = Vec::new();
    for name in ["B", "C", "D"] {
        neurons.push(Neuron::new(name, Axon::default()).dendrite(Dendrite::sync(&x, |_p, _axon, _ctx| Ok(ReactionOutput::Empty))).build());
    }
    let cns = Cns::new(neurons, FacadeOptions::default()).unwrap();

    let seen_lengths_cb = Arc::clone(&seen_lengths);
    let handle = cns.stimulate(
        vec![x.create_signal(1)],
        StimulationOptions {
            config: neurobus::StimulationConfig { concurrency: Some(1), ..Default::default() },
            on_response: Some(Arc::new(move |record| {
                seen_lengths_cb.lock().unwrap().push(record.queue_length);
                Box::pin(std::future::ready(Ok(())))
            })),
            ..Default::default()
        },
    );
    handle.wait_until_complete().await.unwrap();

    let lengths = seen_lengths.lock().unwrap();
    assert_eq!(lengths.len(), 3, "one trace per subscriber; the root signal itself is not traced");
    assert_eq!(*lengths.last().unwrap(), 0);
}

#[tokio::test]
async fn concurrency_one_never_overlaps_two_handlers() {
    let x = Collateral::<u32>::new("x");
    let in_flight = Arc::new(AtomicU32::new(0));
    let overlapped = Arc::new(AtomicU32::new(0));

    let mut neurons = Vec::new();
    for i in 0..4 {
        let in_flight = Arc::clone(&in_flight);
        let overlapped = Arc::clone(&overlapped);
        neurons.push(
            Neuron::new(format!("n{i}"), Axon::default())
                .dendrite(Dendrite::new(&x, move |_p, _axon, _ctx| {
                    let in_flight = Arc::clone(&in_flight);
                    let overlapped = Arc::clone(&overlapped);
                    async move {
                        if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                            overlapped.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::task::yield_now().await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(ReactionOutput::Empty)
                    }
                }))
                .build(),
        );
    }
    let cns = Cns::new(neurons, FacadeOptions::default()).unwrap();
    let handle = cns.stimulate(
        vec![x.create_signal(1)],
        StimulationOptions {
            config: neurobus::StimulationConfig { concurrency: Some(1), ..Default::default() },
            ..Default::default()
        },
    );
    handle.wait_until_complete().await.unwrap();
    assert_eq!(overlapped.load(Ordering::SeqCst), 0);
}
