//! Stress tests for the event bus under high load: burst emission, many
//! sinks, rapid start/stop cycles, and concurrent producers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use hdorch::event_bus::{Event, EventBus, MemorySink};

#[tokio::test]
async fn high_volume_event_emission_is_not_silently_dropped() {
    let sink = MemorySink::new();
    let sink_snapshot = sink.clone();
    let bus = EventBus::with_sink(sink);

    bus.listen_for_events();
    let emitter = bus.get_emitter();

    let event_count = 1000;
    for i in 0..event_count {
        emitter
            .emit(Event::diagnostic("stress", format!("event_{i}")))
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    bus.stop_listener().await;

    let entries = sink_snapshot.snapshot();
    assert_eq!(entries.len(), event_count);
}

#[tokio::test]
async fn many_concurrent_producers_all_land() {
    let sink = MemorySink::new();
    let snap = sink.clone();
    let bus = Arc::new(EventBus::with_sink(sink));
    bus.listen_for_events();

    let producers = 32;
    let events_per_producer = 20;
    let emitter = bus.get_emitter();

    let mut handles = Vec::new();
    for p in 0..producers {
        let emitter = Arc::clone(&emitter);
        handles.push(tokio::spawn(async move {
            for i in 0..events_per_producer {
                emitter
                    .emit(Event::diagnostic("producer", format!("{p}-{i}")))
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    bus.stop_listener().await;

    assert_eq!(snap.snapshot().len(), producers * events_per_producer);
}

#[tokio::test]
async fn many_sinks_all_receive_the_full_stream() {
    let sinks: Vec<MemorySink> = (0..8).map(|_| MemorySink::new()).collect();
    let snapshots: Vec<MemorySink> = sinks.iter().cloned().collect();
    let bus = EventBus::with_sinks(
        sinks
            .into_iter()
            .map(|s| Box::new(s) as Box<dyn hdorch::event_bus::EventSink>)
            .collect(),
    );
    bus.listen_for_events();

    let emitter = bus.get_emitter();
    for i in 0..100 {
        emitter
            .emit(Event::diagnostic("fanout", format!("{i}")))
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    bus.stop_listener().await;

    for snapshot in snapshots {
        assert_eq!(snapshot.snapshot().len(), 100);
    }
}

#[tokio::test]
async fn rapid_start_stop_cycles_capture_every_cycles_events() {
    let sink = MemorySink::new();
    let snap = sink.clone();
    let bus = EventBus::with_sink(sink);

    let cycles = 20;
    for c in 0..cycles {
        bus.listen_for_events();
        let emitter = bus.get_emitter();
        emitter
            .emit(Event::diagnostic("cycle", format!("{c}")))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        bus.stop_listener().await;
    }

    assert_eq!(snap.snapshot().len(), cycles);
}

#[tokio::test]
async fn burst_then_drain_preserves_order_within_a_sink() {
    let sink = MemorySink::new();
    let snap = sink.clone();
    let bus = EventBus::with_sink(sink);
    bus.listen_for_events();

    let emitter = bus.get_emitter();
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..500 {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        emitter
            .emit(Event::diagnostic("burst", format!("{n}")))
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(150)).await;
    bus.stop_listener().await;

    let entries = snap.snapshot();
    assert_eq!(entries.len(), 500);
    let mut prev = -1i64;
    for entry in &entries {
        if let Event::Diagnostic(d) = entry {
            let n: i64 = d.message.parse().unwrap();
            assert!(n > prev);
            prev = n;
        }
    }
}
