//! End-to-end engine behaviour against the register-level model
//!
//! Every test drives the real submit / build / start / complete path; only
//! the BAR and host memory are simulated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use xdma_chip::regs::status;
use xdma_driver::prelude::*;
use xdma_driver::sim::{SimMemory, SimMode, SimulatedEngine};

struct Rig {
    mem: Arc<SimMemory>,
    sim: Arc<SimulatedEngine>,
    engine: Arc<Engine>,
}

fn rig(mode: SimMode, streaming: bool, config: EngineConfig) -> Rig {
    let mem = Arc::new(SimMemory::new());
    rig_on(mem, mode, streaming, config)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn rig_on(mem: Arc<SimMemory>, mode: SimMode, streaming: bool, config: EngineConfig) -> Rig {
    init_tracing();
    let sim = Arc::new(
        SimulatedEngine::new(mem.clone(), config.direction, config.channel)
            .streaming(streaming)
            .mode(mode),
    );
    let engine = Arc::new(Engine::new(config, sim.clone(), mem.as_ref()).expect("engine bring-up"));
    sim.connect_irq(engine.irq_handle());
    Rig { mem, sim, engine }
}

fn small_ring(dir: Direction) -> EngineConfig {
    EngineConfig::new(dir, 0).with_set_count(2).with_set_depth(16)
}

fn buffers(mem: &SimMemory, n: u32, len: u32) -> Vec<ScatterEntry> {
    (0..n)
        .map(|_| {
            let buf = mem.alloc_buffer(len as usize).expect("host buffer");
            ScatterEntry::new(buf.bus_addr(), len)
        })
        .collect()
}

fn reporter(tx: &mpsc::Sender<(u32, Result<usize>)>, tag: u32) -> Option<Callback> {
    let tx = tx.clone();
    Some(Box::new(move |r| {
        let _ = tx.send((tag, r));
    }))
}

fn worker(engine: &Arc<Engine>) -> CompletionWorker {
    CompletionWorker::spawn(engine.clone(), Duration::from_millis(5)).expect("worker thread")
}

#[test]
fn test_request_larger_than_ring_completes_in_two_runs() {
    let r = rig(SimMode::Immediate, false, small_ring(Direction::H2C));
    let _w = worker(&r.engine);

    let list = buffers(&r.mem, 53, 256);
    let done = r
        .engine
        .submit(Direction::H2C, 0, &list, Some(Duration::from_secs(10)), None)
        .expect("transfer");
    assert_eq!(done, 53 * 256);

    let stats = r.engine.stats();
    assert_eq!(stats.sets_closed, 4, "16 + 16, then 16 + 5");
    assert_eq!(stats.hw_starts, 2);
    assert_eq!(stats.descriptors_completed, 53);
    assert_eq!(stats.bytes_completed, 53 * 256);
    assert!(stats.ring_full_events >= 1);
    assert_eq!(r.sim.starts(), 2);

    let snap = r.engine.ring_snapshot();
    assert!(snap.is_drained(), "{snap:?}");
    assert!(snap.is_consistent());
    assert_eq!(r.engine.state(), EngineState::Idle);
}

#[test]
fn test_concurrent_submitters_all_complete() {
    let r = rig(SimMode::Immediate, false, small_ring(Direction::H2C));
    let _w = worker(&r.engine);

    let threads: Vec<_> = (0..4u64)
        .map(|t| {
            let engine = r.engine.clone();
            let list = buffers(&r.mem, 40, 512);
            std::thread::spawn(move || {
                (0..5)
                    .map(|_| {
                        engine.submit(
                            Direction::H2C,
                            t * 0x1_0000,
                            &list,
                            Some(Duration::from_secs(10)),
                            None,
                        )
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    for t in threads {
        for result in t.join().expect("submitter panicked") {
            assert_eq!(result.expect("transfer"), 40 * 512);
        }
    }

    let stats = r.engine.stats();
    assert_eq!(stats.requests_completed, 20);
    assert_eq!(stats.requests_failed, 0);
    assert!(stats.ring_full_events >= 1);
    assert!(r.engine.ring_snapshot().is_drained());
}

#[test]
fn test_hardware_error_fails_everything_queued() {
    let r = rig(SimMode::Manual, false, small_ring(Direction::H2C));
    let (tx, rx) = mpsc::channel();

    let a = buffers(&r.mem, 8, 256);
    let b = buffers(&r.mem, 8, 256);
    let c = buffers(&r.mem, 40, 256);
    for (tag, list) in [(0, &a), (1, &b), (2, &c)] {
        assert_eq!(r.engine.submit(Direction::H2C, 0, list, None, reporter(&tx, tag)).unwrap(), 0);
    }
    assert_eq!(r.engine.state(), EngineState::Running);
    let snap = r.engine.ring_snapshot();
    assert_eq!((snap.avail_sets, snap.pending, snap.in_flight), (0, 1, 2));

    assert_eq!(r.sim.advance(3), 3);
    r.sim.inject_error(status::DESC_ERROR);
    let err = r.engine.service_completions().unwrap_err();
    assert!(matches!(err, DmaError::HardwareError { .. }), "{err}");

    let mut outcomes: Vec<_> = rx.try_iter().collect();
    outcomes.sort_by_key(|(tag, _)| *tag);
    assert_eq!(outcomes.len(), 3);
    for (_, result) in outcomes {
        assert!(matches!(result, Err(DmaError::HardwareError { .. })));
    }

    let snap = r.engine.ring_snapshot();
    assert_eq!(snap.avail_sets, 2);
    assert!(snap.is_drained());
    assert_eq!(r.engine.state(), EngineState::Idle);
    assert_eq!(r.engine.stats().requests_failed, 3);

    // the engine takes new work after an abort
    let d = buffers(&r.mem, 4, 256);
    r.engine.submit(Direction::H2C, 0, &d, None, reporter(&tx, 3)).unwrap();
    assert_eq!(r.sim.starts(), 2);
    assert_eq!(r.sim.run_until_idle(), 4);
    assert_eq!(r.engine.service_completions().unwrap(), 4);
    let (tag, result) = rx.try_recv().expect("completion delivered");
    assert_eq!((tag, result.unwrap()), (3, 4 * 256));
}

#[test]
fn test_streaming_receive_runs_one_set_per_credit_grant() {
    let r = rig(SimMode::Manual, true, small_ring(Direction::C2H));
    assert!(r.engine.is_streaming());
    assert_eq!(r.engine.name(), "C2H0-ST");
    let (tx, rx) = mpsc::channel();

    let list = buffers(&r.mem, 40, 4096);
    r.engine.submit(Direction::C2H, 0, &list, None, reporter(&tx, 0)).unwrap();
    assert_eq!(r.sim.starts(), 1);
    assert_eq!(r.sim.credits(), 16);

    assert_eq!(r.sim.advance(64), 16);
    assert_eq!(r.sim.credits(), 0);
    assert_eq!(r.sim.advance(1), 0);
    assert_eq!(r.engine.ring_snapshot().undrained_results, 16);

    assert_eq!(r.engine.service_completions().unwrap(), 16);
    assert_eq!(r.engine.ring_snapshot().undrained_results, 0);
    assert_eq!(r.sim.starts(), 2, "next set started after the drain");
    assert_eq!(r.sim.credits(), 16);

    for _ in 0..4 {
        if r.engine.ring_snapshot().is_drained() {
            break;
        }
        r.sim.run_until_idle();
        r.engine.service_completions().unwrap();
    }
    let (_, result) = rx.try_recv().expect("completion delivered");
    assert_eq!(result.unwrap(), 40 * 4096);
    assert_eq!(r.sim.starts(), 3);
    assert!(r.engine.ring_snapshot().is_drained());
}

#[test]
fn test_streaming_receive_short_packets() {
    init_tracing();
    let mem = Arc::new(SimMemory::new());
    let sim = Arc::new(
        SimulatedEngine::new(mem.clone(), Direction::C2H, 0)
            .streaming(true)
            .stream_packet_len(100),
    );
    let engine = Arc::new(
        Engine::new(small_ring(Direction::C2H), sim.clone(), mem.as_ref()).expect("engine bring-up"),
    );
    sim.connect_irq(engine.irq_handle());
    let _w = worker(&engine);

    let buf = mem.alloc_buffer(4096).unwrap();
    let list = [ScatterEntry::new(buf.bus_addr(), 4096)];
    let done = engine.submit(Direction::C2H, 0, &list, None, None).unwrap();
    assert_eq!(done, 4096);
    let mut head = [0u8; 100];
    buf.read_bytes(0, &mut head);
    assert!(head.iter().all(|b| *b == head[0] && *b != 0));
}

#[test]
fn test_shutdown_is_idempotent() {
    let r = rig(SimMode::Manual, false, small_ring(Direction::H2C));
    let (tx, rx) = mpsc::channel();
    let list = buffers(&r.mem, 4, 64);
    r.engine.submit(Direction::H2C, 0, &list, None, reporter(&tx, 0)).unwrap();
    r.engine.submit(Direction::H2C, 0, &list, None, reporter(&tx, 1)).unwrap();

    assert_eq!(r.engine.shutdown(), 2);
    assert_eq!(r.engine.shutdown(), 0);
    assert!(r.engine.is_offline());
    assert_eq!(r.engine.state(), EngineState::Idle);
    assert!(!r.sim.is_running());
    for (_, result) in rx.try_iter() {
        assert!(matches!(result, Err(DmaError::ShuttingDown { .. })));
    }
    assert!(r.engine.ring_snapshot().is_drained());

    let err = r.engine.submit(Direction::H2C, 0, &list, None, None).unwrap_err();
    assert!(matches!(err, DmaError::ShuttingDown { .. }));
}

#[test]
fn test_completions_arrive_in_submission_order() {
    let r = rig(SimMode::Immediate, false, small_ring(Direction::H2C));
    let _w = worker(&r.engine);
    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();

    for i in 0..12u32 {
        let list = buffers(&r.mem, 1 + i % 5, 128);
        let order = order.clone();
        let tx = tx.clone();
        let cb: Callback = Box::new(move |res| {
            order.lock().unwrap().push(i);
            let _ = tx.send(res);
        });
        r.engine.submit(Direction::H2C, 0, &list, None, Some(cb)).unwrap();
    }
    for _ in 0..12 {
        rx.recv_timeout(Duration::from_secs(10)).expect("callback").unwrap();
    }
    assert_eq!(*order.lock().unwrap(), (0..12).collect::<Vec<_>>());
}

#[test]
fn test_poll_mode_completes_without_interrupts() {
    let r = rig(
        SimMode::Immediate,
        false,
        small_ring(Direction::H2C).with_completion_mode(CompletionMode::Poll),
    );
    let _w = worker(&r.engine);
    let list = buffers(&r.mem, 3, 1024);
    let done = r.engine.submit(Direction::H2C, 0, &list, None, None).unwrap();
    assert_eq!(done, 3072);
    assert_eq!(r.engine.dump_registers().irq_mask, 0);
    assert!(r.engine.ring_snapshot().is_drained());
}

#[test]
fn test_sync_timeout_leaves_request_queued() {
    let r = rig(SimMode::Manual, false, small_ring(Direction::H2C));
    let list = buffers(&r.mem, 2, 64);
    let err = r
        .engine
        .submit(Direction::H2C, 0, &list, Some(Duration::from_millis(20)), None)
        .unwrap_err();
    assert!(matches!(err, DmaError::Timeout { duration_ms: 20 }), "{err}");
    assert!(!err.is_retryable());
    assert_eq!(err.errno(), -5);
    assert_eq!(r.engine.ring_snapshot().in_flight, 1);
    assert_eq!(r.engine.shutdown(), 1);
}

#[test]
fn test_async_expiry() {
    let r = rig(SimMode::Manual, false, small_ring(Direction::H2C));
    let (tx, rx) = mpsc::channel();
    let short = Some(Duration::from_millis(1));

    let a = buffers(&r.mem, 8, 64);
    let b = buffers(&r.mem, 40, 64);
    let c = buffers(&r.mem, 4, 64);
    r.engine.submit(Direction::H2C, 0, &a, short, reporter(&tx, 0)).unwrap();
    r.engine.submit(Direction::H2C, 0, &b, short, reporter(&tx, 1)).unwrap();
    r.engine.submit(Direction::H2C, 0, &c, short, reporter(&tx, 2)).unwrap();
    let snap = r.engine.ring_snapshot();
    assert_eq!((snap.pending, snap.in_flight), (2, 1));

    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(r.engine.expire_requests(Instant::now()), 3);
    let expired: Vec<_> = rx.try_iter().collect();
    assert_eq!(expired.len(), 3);
    assert!(expired.iter().all(|(_, r)| matches!(r, Err(DmaError::Timeout { .. }))));

    // the never-built request is gone; the others stay for ring accounting
    let snap = r.engine.ring_snapshot();
    assert_eq!((snap.pending, snap.in_flight), (1, 1));
    assert_eq!(r.engine.expire_requests(Instant::now()), 0, "expired once");

    for _ in 0..8 {
        if r.engine.ring_snapshot().is_drained() {
            break;
        }
        r.sim.run_until_idle();
        r.engine.service_completions().unwrap();
    }
    assert!(r.engine.ring_snapshot().is_drained());
    assert!(rx.try_recv().is_err(), "no second notification");

    let stats = r.engine.stats();
    assert_eq!(stats.requests_failed, 3);
    assert_eq!(stats.requests_completed, 0, "expired requests are not also successes");
    assert_eq!(stats.bytes_completed, 0);
}

#[test]
fn test_busy_start_is_retried() {
    let r = rig(SimMode::Immediate, false, small_ring(Direction::H2C));
    let _w = worker(&r.engine);
    r.sim.force_start_busy(2);
    let list = buffers(&r.mem, 2, 64);
    assert_eq!(r.engine.submit(Direction::H2C, 0, &list, None, None).unwrap(), 128);
    assert_eq!(r.engine.stats().start_busy_retries, 2);
}

#[test]
fn test_busy_start_gives_up_after_retry_limit() {
    let r = rig(
        SimMode::Manual,
        false,
        small_ring(Direction::H2C).with_start_retry_limit(1),
    );
    r.sim.force_start_busy(5);
    let list = buffers(&r.mem, 2, 64);
    let (tx, _rx) = mpsc::channel();
    r.engine.submit(Direction::H2C, 0, &list, None, reporter(&tx, 0)).unwrap();
    assert_eq!(r.engine.state(), EngineState::Idle);
    let snap = r.engine.ring_snapshot();
    assert_eq!(snap.sets_ready, 1, "set stays ready for the next start");
    assert!(snap.is_consistent());
}

#[test]
fn test_host_to_card_to_host_round_trip() {
    let mem = Arc::new(SimMemory::new());
    let tx_rig = rig_on(mem.clone(), SimMode::Immediate, false, small_ring(Direction::H2C));
    let rx_rig = rig_on(mem.clone(), SimMode::Immediate, false, small_ring(Direction::C2H));
    let _w1 = worker(&tx_rig.engine);
    let _w2 = worker(&rx_rig.engine);

    let out = buffers(&mem, 2, 4096);
    for (i, e) in out.iter().enumerate() {
        let (region, _) = mem.resolve(e.addr, 4096).unwrap();
        let pattern: Vec<u8> = (0..4096u32).map(|b| (b as u8) ^ (i as u8 * 0x5A)).collect();
        region.write_bytes(0, &pattern);
    }
    assert_eq!(tx_rig.engine.submit(Direction::H2C, 0x1000, &out, None, None).unwrap(), 8192);

    let back = buffers(&mem, 4, 2048);
    assert_eq!(rx_rig.engine.submit(Direction::C2H, 0x1000, &back, None, None).unwrap(), 8192);

    let gather = |list: &[ScatterEntry]| {
        let mut bytes = Vec::new();
        for e in list {
            let (region, off) = mem.resolve(e.addr, e.len as usize).unwrap();
            let mut chunk = vec![0u8; e.len as usize];
            region.read_bytes(off, &mut chunk);
            bytes.extend(chunk);
        }
        bytes
    };
    assert_eq!(gather(&out), gather(&back));
}

#[test]
fn test_dropping_the_engine_shuts_it_down() {
    let r = rig(SimMode::Manual, false, small_ring(Direction::H2C));
    let (tx, rx) = mpsc::channel();
    let list = buffers(&r.mem, 2, 64);
    r.engine.submit(Direction::H2C, 0, &list, None, reporter(&tx, 0)).unwrap();
    let Rig { engine, sim, .. } = r;
    drop(engine);
    assert!(!sim.is_running());
    let (_, result) = rx.try_recv().expect("failed on drop");
    assert!(matches!(result, Err(DmaError::ShuttingDown { .. })));
}

#[test]
fn test_streaming_send_ignores_device_offset() {
    let r = rig(SimMode::Immediate, true, small_ring(Direction::H2C));
    let _w = worker(&r.engine);
    assert_eq!(r.engine.name(), "H2C0-ST");
    let list = buffers(&r.mem, 3, 1000);
    assert_eq!(r.engine.submit(Direction::H2C, 0x7, &list, None, None).unwrap(), 3000);
    assert_eq!(r.sim.stream_bytes(), 3000);
}

#[test]
fn test_poll_mode_hardware_error_fails_everything_queued() {
    let r = rig(
        SimMode::Manual,
        false,
        small_ring(Direction::H2C).with_completion_mode(CompletionMode::Poll),
    );
    let (tx, rx) = mpsc::channel();

    let a = buffers(&r.mem, 8, 256);
    let b = buffers(&r.mem, 8, 256);
    let c = buffers(&r.mem, 40, 256);
    for (tag, list) in [(0, &a), (1, &b), (2, &c)] {
        r.engine.submit(Direction::H2C, 0, list, None, reporter(&tx, tag)).unwrap();
    }
    assert_eq!(r.engine.state(), EngineState::Running);
    assert_eq!(r.engine.ring_snapshot().avail_sets, 0);

    assert_eq!(r.sim.advance(3), 3);
    r.sim.inject_error(status::DESC_ERROR);
    let err = r.engine.service_completions().unwrap_err();
    assert!(matches!(err, DmaError::HardwareError { .. }), "{err}");

    let outcomes: Vec<_> = rx.try_iter().collect();
    assert_eq!(outcomes.len(), 3);
    for (tag, result) in outcomes {
        assert!(matches!(result, Err(DmaError::HardwareError { .. })), "request {tag}: {result:?}");
    }
    let snap = r.engine.ring_snapshot();
    assert_eq!(snap.avail_sets, snap.sets);
    assert!(snap.is_drained());
    assert_eq!(r.engine.state(), EngineState::Idle);
    assert_eq!(r.engine.stats().requests_failed, 3);

    let d = buffers(&r.mem, 4, 256);
    r.engine.submit(Direction::H2C, 0, &d, None, reporter(&tx, 3)).unwrap();
    assert_eq!(r.sim.run_until_idle(), 4);
    assert_eq!(r.engine.service_completions().unwrap(), 4);
    let (tag, result) = rx.try_recv().expect("completion delivered");
    assert_eq!((tag, result.unwrap()), (3, 4 * 256));
}

#[test]
fn test_racing_submitters_share_the_last_open_set() {
    let r = rig(SimMode::Manual, false, small_ring(Direction::H2C));
    let (tx, rx) = mpsc::channel();

    // the first request closes set 0, leaving one set to fight over
    let first = buffers(&r.mem, 16, 256);
    r.engine.submit(Direction::H2C, 0, &first, None, reporter(&tx, 0)).unwrap();
    let snap = r.engine.ring_snapshot();
    assert_eq!((snap.avail_sets, snap.in_flight_sets), (1, 1));

    let gate = Arc::new(Barrier::new(2));
    let racers: Vec<_> = (1..=2u64)
        .map(|t| {
            let engine = r.engine.clone();
            let gate = gate.clone();
            let list = buffers(&r.mem, 10, 256);
            std::thread::spawn(move || {
                gate.wait();
                engine.submit(
                    Direction::H2C,
                    t * 0x1_0000,
                    &list,
                    Some(Duration::from_secs(10)),
                    None,
                )
            })
        })
        .collect();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let snap = r.engine.ring_snapshot();
        if snap.pending + snap.in_flight == 3 {
            break;
        }
        assert!(Instant::now() < deadline, "submitters never queued: {snap:?}");
        std::thread::yield_now();
    }

    while !racers.iter().all(std::thread::JoinHandle::is_finished) {
        assert!(Instant::now() < deadline, "racing submitters stalled");
        if r.sim.advance(1) > 0 {
            r.engine.service_completions().unwrap();
        } else {
            let _ = r.engine.process_pending();
            std::thread::yield_now();
        }
        let snap = r.engine.ring_snapshot();
        assert!(snap.is_consistent(), "{snap:?}");
    }

    for t in racers {
        assert_eq!(t.join().expect("submitter panicked").unwrap(), 10 * 256);
    }
    let (tag, result) = rx.try_recv().expect("first request delivered");
    assert_eq!((tag, result.unwrap()), (0, 16 * 256));
    assert!(r.engine.ring_snapshot().is_drained());
    assert_eq!(r.engine.stats().requests_completed, 3);
}

#[test]
fn test_device_range_past_the_address_space_is_rejected() {
    let r = rig(SimMode::Manual, false, small_ring(Direction::H2C));
    let list = buffers(&r.mem, 2, 64);
    let err = r
        .engine
        .submit(Direction::H2C, u64::MAX - 100, &list, None, None)
        .unwrap_err();
    assert!(matches!(err, DmaError::InvalidArgument { .. }), "{err}");

    let wrapping = [ScatterEntry::new(u64::MAX - 0xFF, 0x1000)];
    let err = r.engine.submit(Direction::H2C, 0, &wrapping, None, None).unwrap_err();
    assert!(matches!(err, DmaError::InvalidArgument { .. }), "{err}");

    let snap = r.engine.ring_snapshot();
    assert_eq!((snap.pending, snap.in_flight), (0, 0));
    assert_eq!(r.sim.starts(), 0);
}

#[test]
fn test_streaming_receive_with_a_racing_service_thread() {
    let r = rig(SimMode::Manual, true, small_ring(Direction::C2H));
    let stop = Arc::new(AtomicBool::new(false));
    let servicer = {
        let engine = r.engine.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let _ = engine.service_completions();
                std::thread::yield_now();
            }
        })
    };

    let (tx, rx) = mpsc::channel();
    let list = buffers(&r.mem, 16, 256);
    for round in 0..12u32 {
        let fail = round % 4 == 3;
        r.engine.submit(Direction::C2H, 0, &list, None, reporter(&tx, round)).unwrap();
        if fail {
            r.sim.advance(5);
            r.sim.inject_error(status::DESC_ERROR);
        }
        let deadline = Instant::now() + Duration::from_secs(10);
        let (tag, result) = loop {
            if let Ok(outcome) = rx.try_recv() {
                break outcome;
            }
            assert!(Instant::now() < deadline, "round {round} stalled");
            r.sim.advance(1);
            std::thread::yield_now();
        };
        assert_eq!(tag, round);
        if fail {
            assert!(matches!(result, Err(DmaError::HardwareError { .. })), "{result:?}");
        } else {
            assert_eq!(result.unwrap(), 16 * 256, "round {round}");
        }
    }

    stop.store(true, Ordering::Relaxed);
    servicer.join().expect("service thread panicked");
    let snap = r.engine.ring_snapshot();
    assert!(snap.is_drained(), "{snap:?}");
    assert_eq!(snap.undrained_results, 0);
}
