use chrono::{DateTime, TimeZone, Utc};
use powerwatch_core::fanout::SinkError;
use powerwatch_core::{
    dispatch_queue, EventSink, PowerEvent, PowerState, StreamFanout, Subscription,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

fn t(secs: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 12, 20, 12, 0, secs).unwrap()
}

fn standby(secs: u32) -> PowerEvent {
    PowerEvent::new(PowerState::Standby, t(secs))
}

fn awake(secs: u32) -> PowerEvent {
    PowerEvent::new(PowerState::Awake, t(secs))
}

async fn next(sub: &mut Subscription) -> PowerEvent {
    tokio::time::timeout(Duration::from_millis(500), sub.recv())
        .await
        .expect("timeout")
        .expect("subscription closed")
}

async fn nothing_more(sub: &mut Subscription) {
    let extra = tokio::time::timeout(Duration::from_millis(100), sub.recv()).await;
    assert!(extra.is_err(), "unexpected extra event: {:?}", extra);
}

fn spawn_dispatcher(fanout: &StreamFanout) -> (powerwatch_core::QueueSender, JoinHandle<()>) {
    let (tx, rx) = dispatch_queue();
    let handle = tokio::spawn(fanout.clone().run(rx));
    (tx, handle)
}

/// Sink that fails once its switch is flipped, like a client whose socket went away
struct FlakySink {
    broken: Arc<AtomicBool>,
    seen: Arc<parking_lot::Mutex<Vec<PowerEvent>>>,
}

impl EventSink for FlakySink {
    fn deliver(&self, event: PowerEvent) -> Result<(), SinkError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(SinkError::Failed("connection reset".into()));
        }
        self.seen.lock().push(event);
        Ok(())
    }
}

#[tokio::test]
async fn clients_observe_queue_order_without_gaps_or_duplicates() {
    let fanout = StreamFanout::new();
    let mut a = fanout.subscribe();
    let mut b = fanout.subscribe();
    let (tx, _dispatcher) = spawn_dispatcher(&fanout);

    let events: Vec<PowerEvent> = (0..40)
        .map(|i| if i % 2 == 0 { standby(i) } else { awake(i) })
        .collect();
    for e in &events {
        tx.enqueue(e.clone()).unwrap();
    }

    for expected in &events {
        assert_eq!(&next(&mut a).await, expected);
        assert_eq!(&next(&mut b).await, expected);
    }
    nothing_more(&mut a).await;
    nothing_more(&mut b).await;
}

#[tokio::test]
async fn duplicates_from_the_broker_are_forwarded_as_is() {
    let fanout = StreamFanout::new();
    let mut sub = fanout.subscribe();
    let (tx, _dispatcher) = spawn_dispatcher(&fanout);

    tx.enqueue(awake(1)).unwrap();
    tx.enqueue(awake(1)).unwrap();

    assert_eq!(next(&mut sub).await, awake(1));
    assert_eq!(next(&mut sub).await, awake(1));
}

#[tokio::test]
async fn failing_sink_does_not_block_other_clients() {
    let fanout = StreamFanout::new();
    let broken = Arc::new(AtomicBool::new(false));
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let mut before = fanout.subscribe();
    let flaky_id = fanout.subscribe_sink(FlakySink {
        broken: broken.clone(),
        seen: seen.clone(),
    });
    let mut after = fanout.subscribe();
    assert_eq!(fanout.subscriber_count(), 3);

    let report = fanout.dispatch(&standby(1));
    assert_eq!(report.delivered, 3);

    broken.store(true, Ordering::SeqCst);
    let report = fanout.dispatch(&awake(2));
    assert_eq!(report.delivered, 2);
    assert_eq!(report.dropped, 1);

    for sub in [&mut before, &mut after] {
        assert_eq!(next(sub).await, standby(1));
        assert_eq!(next(sub).await, awake(2));
    }
    assert_eq!(*seen.lock(), vec![standby(1)]);
    assert_eq!(fanout.subscriber_count(), 2);
    assert!(!fanout.unsubscribe(flaky_id), "failed sink should already be gone");
}

#[tokio::test]
async fn late_subscriber_gets_no_replay() {
    let fanout = StreamFanout::new();
    let mut early = fanout.subscribe();
    let (tx, _dispatcher) = spawn_dispatcher(&fanout);

    tx.enqueue(standby(1)).unwrap();
    tx.enqueue(awake(2)).unwrap();
    assert_eq!(next(&mut early).await, standby(1));
    assert_eq!(next(&mut early).await, awake(2));

    let mut late = fanout.subscribe();
    tx.enqueue(standby(3)).unwrap();

    assert_eq!(next(&mut late).await, standby(3));
    nothing_more(&mut late).await;
    assert_eq!(next(&mut early).await, standby(3));
}

#[tokio::test]
async fn standby_then_awake_reaches_connected_client_in_order() {
    let fanout = StreamFanout::new();
    let mut client = fanout.subscribe();
    let (tx, _dispatcher) = spawn_dispatcher(&fanout);

    tx.enqueue(standby(1)).unwrap();
    tx.enqueue(awake(2)).unwrap();

    assert_eq!(next(&mut client).await, standby(1));
    assert_eq!(next(&mut client).await, awake(2));
}

#[tokio::test]
async fn remaining_client_still_receives_after_peer_disconnects() {
    let fanout = StreamFanout::new();
    let mut stays = fanout.subscribe();
    let mut leaves = fanout.subscribe();
    let (tx, dispatcher) = spawn_dispatcher(&fanout);

    tx.enqueue(standby(1)).unwrap();
    assert_eq!(next(&mut stays).await, standby(1));
    assert_eq!(next(&mut leaves).await, standby(1));

    drop(leaves);
    tx.enqueue(awake(2)).unwrap();
    assert_eq!(next(&mut stays).await, awake(2));
    assert_eq!(fanout.subscriber_count(), 1);
    assert!(!dispatcher.is_finished());
}

#[tokio::test]
async fn closing_queue_drains_then_stops_dispatch_loop() {
    let fanout = StreamFanout::new();
    let mut sub = fanout.subscribe();
    let (tx, dispatcher) = spawn_dispatcher(&fanout);

    tx.enqueue(standby(1)).unwrap();
    tx.enqueue(awake(2)).unwrap();
    drop(tx);

    tokio::time::timeout(Duration::from_secs(1), dispatcher)
        .await
        .expect("dispatch loop did not stop")
        .unwrap();
    assert_eq!(next(&mut sub).await, standby(1));
    assert_eq!(next(&mut sub).await, awake(2));
}

#[tokio::test]
async fn concurrent_subscribes_keep_registry_consistent() {
    let fanout = StreamFanout::new();
    let mut tasks = Vec::new();
    for _ in 0..32 {
        let fanout = fanout.clone();
        tasks.push(tokio::spawn(async move {
            let sub = fanout.subscribe();
            tokio::task::yield_now().await;
            sub
        }));
    }
    let mut subs = Vec::new();
    for task in tasks {
        subs.push(task.await.unwrap());
    }
    assert_eq!(fanout.subscriber_count(), 32);

    let mut ids: Vec<u64> = subs.iter().map(|s| s.id()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 32);

    let report = fanout.dispatch(&awake(9));
    assert_eq!(report.delivered, 32);
    subs.truncate(10);
    assert_eq!(fanout.subscriber_count(), 10);
}
