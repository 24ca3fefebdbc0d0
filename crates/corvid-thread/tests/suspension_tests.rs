//! Stop-the-world handshake across real OS threads
//!
//! The mutators here simulate managed code: a loop that "calls" a callee by
//! writing a return address into a stack slot and "returns" by reading it
//! back. A simulated OS suspender can only stop a mutator at explicit stop
//! points, which stand in for instruction boundaries.

use corvid_thread::{
    FrameFlags, LimitedContext, ObjectRef, ReturnAddressLocation, ReturnKind, ReturnSlot,
    RootSlot, RuntimeConfig, StackWalker, Thread, ThreadStore, ThreadSuspender, TransitionFrame,
    WalkStart,
};
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

const REAL_RA: usize = 0x7000_4000;
const MUTATOR_IP: usize = 0x7000_3f00;
const RESULT_OBJ: usize = 0x5000_0010;
const RELOCATED_OBJ: usize = 0x6000_0010;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        suspend_poll_interval_us: 50,
        ..RuntimeConfig::default()
    }
}

/// State shared between one simulated mutator and the collector
struct Mutator {
    /// Return-address slot of the callee's frame
    return_slot: AtomicUsize,
    /// True between the simulated call and return
    in_callee: AtomicBool,
    stop_requested: AtomicBool,
    stopped: AtomicBool,
    finish: AtomicBool,
    iterations: AtomicUsize,
    landings: AtomicUsize,
    wrong_returns: AtomicUsize,
    relocated_seen: AtomicBool,
}

impl Mutator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            return_slot: AtomicUsize::new(0),
            in_callee: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            finish: AtomicBool::new(false),
            iterations: AtomicUsize::new(0),
            landings: AtomicUsize::new(0),
            wrong_returns: AtomicUsize::new(0),
            relocated_seen: AtomicBool::new(false),
        })
    }

    fn stop_point(&self) {
        if self.stop_requested.load(Ordering::SeqCst) {
            self.stopped.store(true, Ordering::SeqCst);
            while self.stop_requested.load(Ordering::SeqCst) {
                thread::yield_now();
            }
            self.stopped.store(false, Ordering::SeqCst);
        }
    }

    /// One iteration of the managed loop: call, run, return
    fn step(&self, thread: &Thread) {
        self.stop_point();

        self.return_slot.store(REAL_RA, Ordering::SeqCst);
        self.in_callee.store(true, Ordering::SeqCst);

        self.stop_point();

        let ra = self.return_slot.load(Ordering::SeqCst);
        self.in_callee.store(false, Ordering::SeqCst);

        let resumed_at = match thread.coordinator().hijack_targets().kind_of(ra) {
            Some(kind) => {
                let mut frame = TransitionFrame::capture(0, 0x9000, 0x9010);
                frame.return_value = ObjectRef::from_addr(RESULT_OBJ);
                let resumed = thread.on_hijack_return(kind, &mut frame);
                if frame.return_value == ObjectRef::from_addr(RELOCATED_OBJ) {
                    self.relocated_seen.store(true, Ordering::SeqCst);
                }
                self.landings.fetch_add(1, Ordering::SeqCst);
                resumed
            }
            None => ra,
        };

        if resumed_at != REAL_RA {
            self.wrong_returns.fetch_add(1, Ordering::SeqCst);
        }
        self.iterations.fetch_add(1, Ordering::SeqCst);
    }

    fn spawn(self: &Arc<Self>, store: &Arc<ThreadStore>) -> (Arc<Thread>, thread::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel();
        let mutator = self.clone();
        let store = store.clone();

        let handle = thread::spawn(move || {
            let thread = store.attach_current_thread().unwrap();

            // Allocate from the cache before entering the loop
            let ctx = unsafe { thread.alloc_context_mut() };
            ctx.set_window(0x10_0000, 0x10_1000);
            assert!(ctx.try_bump(48, 8).is_some());

            tx.send(thread.clone()).unwrap();
            while !mutator.finish.load(Ordering::SeqCst) {
                mutator.step(&thread);
            }
            store.detach_current_thread();
        });

        (rx.recv().unwrap(), handle)
    }
}

/// Stops a mutator at its next stop point
struct SimulatedSuspender {
    mutators: Vec<(u64, Arc<Mutator>)>,
}

impl SimulatedSuspender {
    fn mutator(&self, thread: &Thread) -> Option<&Arc<Mutator>> {
        self.mutators
            .iter()
            .find(|(id, _)| *id == thread.logging_id())
            .map(|(_, m)| m)
    }
}

impl ThreadSuspender for SimulatedSuspender {
    fn suspend(&self, thread: &Thread) -> Option<LimitedContext> {
        let mutator = self.mutator(thread)?;
        while mutator.stopped.load(Ordering::SeqCst) {
            thread::yield_now();
        }

        mutator.stop_requested.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_millis(20);
        while !mutator.stopped.load(Ordering::SeqCst) {
            // A thread that parked or went native will not reach a stop point
            if !thread.is_current_thread_in_cooperative_mode() || Instant::now() > deadline {
                mutator.stop_requested.store(false, Ordering::SeqCst);
                return None;
            }
            thread::yield_now();
        }
        Some(LimitedContext::new(MUTATOR_IP, 0x9000, 0x9010))
    }

    fn resume(&self, thread: &Thread) {
        if let Some(mutator) = self.mutator(thread) {
            mutator.stop_requested.store(false, Ordering::SeqCst);
        }
    }
}

/// Walks nothing but the simulated callee frame
struct SimulatedWalker {
    mutators: Vec<(u64, Arc<Mutator>)>,
    starts: Mutex<Vec<(WalkStart, Option<TransitionFrame>)>>,
}

impl StackWalker for SimulatedWalker {
    fn walk(&self, _: &Thread, start: WalkStart, _: &mut dyn FnMut(RootSlot)) {
        let frame = match start {
            WalkStart::TransitionFrame(frame) => Some(unsafe { frame.read() }),
            _ => None,
        };
        self.starts.lock().push((start, frame));
    }

    fn locate_return_address(&self, thread: &Thread, ctx: &LimitedContext) -> Option<ReturnAddressLocation> {
        assert_eq!(ctx.ip, MUTATOR_IP);
        let (_, mutator) = self.mutators.iter().find(|(id, _)| *id == thread.logging_id())?;
        if !mutator.in_callee.load(Ordering::SeqCst) {
            return None;
        }
        let slot = NonNull::from(&mutator.return_slot).cast::<usize>();
        Some(ReturnAddressLocation {
            slot: unsafe { ReturnSlot::new(slot) },
            kind: ReturnKind::Object,
        })
    }
}

#[test]
fn test_hijack_brings_looping_thread_to_safe_point() {
    init_logging();
    let store = ThreadStore::new(test_config());
    let mutator = Mutator::new();
    let (thread, handle) = mutator.spawn(&store);

    // Let the loop get going
    while mutator.iterations.load(Ordering::SeqCst) < 100 {
        thread::yield_now();
    }

    let suspender = SimulatedSuspender {
        mutators: vec![(thread.logging_id(), mutator.clone())],
    };
    let walker = SimulatedWalker {
        mutators: vec![(thread.logging_id(), mutator.clone())],
        starts: Mutex::new(Vec::new()),
    };

    store.suspend_all_threads(&suspender, &walker);

    // Parked at the landing, walkable from the landing frame
    assert!(!thread.is_current_thread_in_cooperative_mode());
    assert!(!thread.is_hijacked());
    assert!(thread.cached_transition_frame().is_some());
    let frozen = mutator.iterations.load(Ordering::SeqCst);

    let mut roots = Vec::new();
    let summary = thread.scan_roots(&walker, &mut |slot| roots.push(slot));
    assert_eq!(summary.stack_roots, 1);
    assert_eq!(roots.len(), 1);
    assert_eq!(unsafe { roots[0].load() }, ObjectRef::from_addr(RESULT_OBJ));

    // Relocate the returned object while the thread is parked
    unsafe { roots[0].slot.as_ptr().write(ObjectRef::from_addr(RELOCATED_OBJ)) };

    {
        let starts = walker.starts.lock();
        let (start, frame) = starts.last().unwrap();
        assert!(matches!(start, WalkStart::TransitionFrame(_)));
        let frame = frame.unwrap();
        assert_eq!(frame.return_address, REAL_RA);
        assert!(frame.flags.contains(FrameFlags::HIJACK_LANDING));
        assert!(frame.flags.contains(FrameFlags::RETURN_IS_GC_REF));
    }

    thread::sleep(Duration::from_millis(10));
    assert_eq!(mutator.iterations.load(Ordering::SeqCst), frozen);

    store.resume_all_threads();

    // The thread resumes with its real return address
    while mutator.iterations.load(Ordering::SeqCst) < frozen + 100 {
        thread::yield_now();
    }
    mutator.finish.store(true, Ordering::SeqCst);
    handle.join().unwrap();

    assert!(mutator.landings.load(Ordering::SeqCst) >= 1);
    assert_eq!(mutator.wrong_returns.load(Ordering::SeqCst), 0);
    assert!(mutator.relocated_seen.load(Ordering::SeqCst));
    assert!(store.coordinator().stats.hijacks() >= 1);
    assert_eq!(store.coordinator().stats.suspensions(), 1);
}

#[test]
fn test_native_thread_is_parked_without_hijack() {
    init_logging();
    let store = ThreadStore::new(test_config());
    let (ready_tx, ready_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let returned = Arc::new(AtomicBool::new(false));

    let handle = {
        let store = store.clone();
        let returned = returned.clone();
        thread::spawn(move || {
            let thread = store.attach_current_thread().unwrap();
            let frame = TransitionFrame::capture(REAL_RA, 0x9000, 0x9010);
            thread.run_preemptive(&frame, || {
                ready_tx.send(thread.clone()).unwrap();
                go_rx.recv().unwrap();
            });
            returned.store(true, Ordering::SeqCst);
            store.detach_current_thread();
        })
    };
    let thread = ready_rx.recv().unwrap();

    let suspender = SimulatedSuspender { mutators: Vec::new() };
    let walker = SimulatedWalker {
        mutators: Vec::new(),
        starts: Mutex::new(Vec::new()),
    };
    assert_eq!(store.suspend_all_threads(&suspender, &walker), 1);
    assert_eq!(store.coordinator().stats.hijacks(), 0);

    // Let the native call finish; the thread must not get back into managed code
    go_tx.send(()).unwrap();
    thread::sleep(Duration::from_millis(20));
    assert!(!returned.load(Ordering::SeqCst));

    let summary = thread.scan_roots(&walker, &mut |_| {});
    assert_eq!(summary.total(), 0);
    let (start, frame) = walker.starts.lock()[0];
    assert!(matches!(start, WalkStart::TransitionFrame(_)));
    assert_eq!(frame.unwrap().return_address, REAL_RA);

    store.resume_all_threads();
    handle.join().unwrap();
    assert!(returned.load(Ordering::SeqCst));
}

#[test]
fn test_repeated_suspensions_with_several_mutators() {
    init_logging();
    let store = ThreadStore::new(test_config());
    let mutators: Vec<_> = (0..3).map(|_| Mutator::new()).collect();
    let spawned: Vec<_> = mutators.iter().map(|m| m.spawn(&store)).collect();

    let registry: Vec<_> = spawned
        .iter()
        .zip(&mutators)
        .map(|((thread, _), m)| (thread.logging_id(), m.clone()))
        .collect();
    let suspender = SimulatedSuspender {
        mutators: registry.clone(),
    };
    let walker = SimulatedWalker {
        mutators: registry,
        starts: Mutex::new(Vec::new()),
    };

    for _ in 0..5 {
        store.suspend_all_threads(&suspender, &walker);
        for (thread, _) in &spawned {
            assert!(!thread.is_current_thread_in_cooperative_mode());
            thread.scan_roots(&walker, &mut |_| {});
        }
        store.resume_all_threads();
        thread::sleep(Duration::from_millis(1));
    }

    for m in &mutators {
        m.finish.store(true, Ordering::SeqCst);
    }
    for (_, handle) in spawned {
        handle.join().unwrap();
    }

    for m in &mutators {
        assert_eq!(m.wrong_returns.load(Ordering::SeqCst), 0);
    }
    assert_eq!(store.coordinator().stats.suspensions(), 5);
    assert_eq!(store.thread_count(), 0);
}
