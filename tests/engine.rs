use ahash::RandomState;
use lungo::scheduler::{Command, DisabledTask, Executor, FnExecutor, Scheduler, ThreadScheduler};
use lungo::{Engine, EngineBuilder, Error};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

fn make_engine(cap: i64) -> Engine {
    EngineBuilder::new(cap).build().unwrap()
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[test]
fn negative_capacity_is_rejected() {
    let err = EngineBuilder::new(-1).build().unwrap_err();
    assert!(matches!(err, Error::NegativeCapacity(-1)));
}

#[test]
fn zero_tolerance_is_rejected() {
    let err = EngineBuilder::new(10)
        .tolerance(Duration::ZERO)
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTolerance));
}

#[test]
fn builder_shortcut_matches_builder() {
    let engine = Engine::builder(16).build().unwrap();
    engine.record_access(&1u64);
    assert_eq!(engine.frequency(&1u64), 1);
}

#[test]
fn debug_output_shows_sizing_and_tolerance() {
    let engine = EngineBuilder::new(64)
        .tolerance(Duration::from_millis(5))
        .build()
        .unwrap();
    let shown = format!("{engine:?}");
    assert!(shown.starts_with("Engine"));
    assert!(shown.contains("table_len: 64"));
    assert!(shown.contains("sample_size: 640"));
    assert!(shown.contains("5ms"));
}

#[test]
fn seeded_hasher_gives_repeatable_estimates() {
    let seeded = || {
        EngineBuilder::new(16)
            .hasher(RandomState::with_seeds(1, 2, 3, 4))
            .build()
            .unwrap()
    };
    let first = seeded();
    let second = seeded();
    for key in 0..500u64 {
        for _ in 0..key % 4 {
            first.record_access(&key);
            second.record_access(&key);
        }
    }
    for key in 0..600u64 {
        assert_eq!(first.frequency(&key), second.frequency(&key), "key {key}");
    }
}

// ---------------------------------------------------------------------------
// Frequency estimation
// ---------------------------------------------------------------------------

#[test]
fn accesses_are_counted() {
    let engine = make_engine(100);
    assert_eq!(engine.frequency("page"), 0);
    for _ in 0..3 {
        engine.record_access("page");
    }
    assert_eq!(engine.frequency("page"), 3);
}

#[test]
fn frequency_saturates_at_fifteen() {
    let engine = make_engine(64);
    for _ in 0..20 {
        engine.record_access(&99u32);
    }
    assert_eq!(engine.frequency(&99u32), 15);
}

#[test]
fn growing_capacity_forgets_history() {
    let engine = make_engine(64);
    for _ in 0..5 {
        engine.record_access("k");
    }

    engine.set_capacity(32).unwrap();
    assert_eq!(engine.frequency("k"), 5, "shrinking must keep counts");

    engine.set_capacity(4_096).unwrap();
    assert_eq!(engine.frequency("k"), 0, "growing must discard counts");

    assert!(matches!(
        engine.set_capacity(-3),
        Err(Error::NegativeCapacity(-3))
    ));
}

#[test]
fn concurrent_accesses_are_all_recorded() {
    let engine = make_engine(1_000);
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            thread::spawn(move || {
                for _ in 0..2 {
                    engine.record_access("shared");
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(engine.frequency("shared"), 8);
}

// ---------------------------------------------------------------------------
// Maintenance pacing
// ---------------------------------------------------------------------------

fn counting_engine(
    tolerance: Duration,
) -> (Engine<ThreadScheduler>, Arc<AtomicUsize>, mpsc::Receiver<()>) {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let (tx, rx) = mpsc::channel();
    let engine = EngineBuilder::new(100)
        .scheduler(ThreadScheduler::new().unwrap())
        .tolerance(tolerance)
        .maintenance(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        })
        .build()
        .unwrap();
    (engine, runs, rx)
}

#[test]
fn disabled_maintenance_is_never_scheduled() {
    let engine = make_engine(10);
    engine.schedule_maintenance(Duration::ZERO).unwrap();
    assert!(!engine.is_maintenance_scheduled());
}

#[test]
fn burst_of_requests_runs_maintenance_once() {
    let (engine, runs, rx) = counting_engine(Duration::from_millis(50));
    for _ in 0..10 {
        engine.schedule_maintenance(Duration::ZERO).unwrap();
    }
    assert!(engine.is_maintenance_scheduled());
    assert!(engine.next_maintenance().is_some());

    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    thread::sleep(Duration::from_millis(150));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(!engine.is_maintenance_scheduled());
}

#[test]
fn fired_maintenance_can_be_rearmed() {
    let (engine, runs, rx) = counting_engine(Duration::from_millis(10));
    engine.schedule_maintenance(Duration::ZERO).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    engine.schedule_maintenance(Duration::ZERO).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn cancelled_maintenance_does_not_run() {
    let (engine, runs, _rx) = counting_engine(Duration::from_millis(50));
    engine.schedule_maintenance(Duration::ZERO).unwrap();
    engine.cancel_maintenance();
    assert!(!engine.is_maintenance_scheduled());
    assert!(engine.next_maintenance().is_none());

    thread::sleep(Duration::from_millis(200));
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    // cancelling again is harmless
    engine.cancel_maintenance();
}

#[test]
fn urgent_request_supersedes_a_distant_one() {
    let (engine, runs, rx) = counting_engine(Duration::from_millis(10));
    engine.schedule_maintenance(Duration::from_secs(60)).unwrap();
    let distant = engine.next_maintenance().unwrap();

    engine.schedule_maintenance(Duration::ZERO).unwrap();
    assert!(engine.next_maintenance().unwrap() < distant);

    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn maintenance_is_handed_to_the_configured_executor() {
    let handed_over = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    let engine = {
        let handed_over = Arc::clone(&handed_over);
        EngineBuilder::new(100)
            .scheduler(ThreadScheduler::new().unwrap())
            .tolerance(Duration::from_millis(10))
            .executor(FnExecutor(move |command: Command| {
                handed_over.fetch_add(1, Ordering::SeqCst);
                command();
            }))
            .maintenance(move || {
                let _ = tx.send(());
            })
            .build()
            .unwrap()
    };

    engine.schedule_maintenance(Duration::ZERO).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(handed_over.load(Ordering::SeqCst), 1);
}

/// Runs the command before returning, like a scheduler with a zero-delay
/// direct executor.
struct ImmediateScheduler;

impl Scheduler for ImmediateScheduler {
    type Task = DisabledTask;

    fn schedule(
        &self,
        executor: &Arc<dyn Executor>,
        command: Command,
        _delay: Duration,
    ) -> lungo::Result<DisabledTask> {
        executor.execute(command);
        Ok(DisabledTask)
    }
}

#[test]
fn reentrant_request_from_the_scheduler_is_absorbed() {
    let slot: Arc<OnceLock<Engine<ImmediateScheduler>>> = Arc::new(OnceLock::new());
    let runs = Arc::new(AtomicUsize::new(0));

    let engine = {
        let slot = Arc::clone(&slot);
        let runs = Arc::clone(&runs);
        EngineBuilder::new(10)
            .scheduler(ImmediateScheduler)
            .maintenance(move || {
                runs.fetch_add(1, Ordering::SeqCst);
                if let Some(engine) = slot.get() {
                    engine.schedule_maintenance(Duration::ZERO).unwrap();
                }
            })
            .build()
            .unwrap()
    };
    assert!(slot.set(engine.clone()).is_ok());

    engine.schedule_maintenance(Duration::ZERO).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}
