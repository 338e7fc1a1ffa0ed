use fibra::{Proactor, ProactorHandle, ProactorStats};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

fn spawn_proactor() -> (ProactorHandle, JoinHandle<ProactorStats>) {
    let (tx, rx) = mpsc::channel();

    let join = thread::spawn(move || {
        let proactor = Proactor::new(0);
        tx.send(proactor.handle()).unwrap();
        proactor.run(&mut ());
        proactor.stats()
    });

    (rx.recv().unwrap(), join)
}

fn wait_for(deadline: Duration, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < deadline, "condition never became true");
        thread::sleep(Duration::from_micros(100));
    }
}

#[test]
fn test_periodic_cadence_and_cancel() {
    let (handle, join) = spawn_proactor();

    let count = Arc::new(AtomicU32::new(0));
    let timer_id = Arc::new(AtomicU64::new(0));
    let started = Arc::new(AtomicBool::new(false));

    {
        let count = count.clone();
        let timer_id = timer_id.clone();
        let started = started.clone();
        handle.dispatch(move |proactor| {
            let count = count.clone();
            let id = proactor.add_periodic(Duration::from_millis(10), move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
            timer_id.store(id, Ordering::SeqCst);
            started.store(true, Ordering::SeqCst);
        });
    }

    wait_for(Duration::from_secs(1), || started.load(Ordering::SeqCst));
    thread::sleep(Duration::from_millis(200));

    let cancelled = Arc::new(AtomicBool::new(false));
    {
        let timer_id = timer_id.clone();
        let cancelled = cancelled.clone();
        handle.dispatch(move |proactor| {
            proactor.cancel_periodic(timer_id.load(Ordering::SeqCst));
            cancelled.store(true, Ordering::SeqCst);
        });
    }
    wait_for(Duration::from_secs(1), || cancelled.load(Ordering::SeqCst));

    let at_cancel = count.load(Ordering::SeqCst);
    assert!(
        (18..=22).contains(&at_cancel),
        "10ms periodic fired {at_cancel} times in 200ms"
    );

    // A cancelled timer must stay silent.
    thread::sleep(Duration::from_millis(100));
    assert_eq!(count.load(Ordering::SeqCst), at_cancel, "timer fired after cancel");

    handle.stop();
    let stats = join.join().unwrap();

    let baseline = if cfg!(target_os = "linux") { 1 } else { 0 };
    assert_eq!(stats.armed_entries, baseline, "cancel leaked the timer slot");
}

#[test]
fn test_cancel_before_first_fire() {
    let (handle, join) = spawn_proactor();

    let count = Arc::new(AtomicU32::new(0));
    let done = Arc::new(AtomicBool::new(false));

    {
        let count = count.clone();
        let done = done.clone();
        handle.dispatch(move |proactor| {
            let count = count.clone();
            let id = proactor.add_periodic(Duration::from_millis(100), move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
            proactor.cancel_periodic(id);
            done.store(true, Ordering::SeqCst);
        });
    }
    wait_for(Duration::from_secs(1), || done.load(Ordering::SeqCst));

    thread::sleep(Duration::from_millis(150));
    assert_eq!(count.load(Ordering::SeqCst), 0, "cancelled timer still fired");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn test_two_periodic_timers_independent() {
    let (handle, join) = spawn_proactor();

    let fast = Arc::new(AtomicU32::new(0));
    let slow = Arc::new(AtomicU32::new(0));
    let ids = Arc::new(AtomicU64::new(0));
    let started = Arc::new(AtomicBool::new(false));

    {
        let fast = fast.clone();
        let slow = slow.clone();
        let ids = ids.clone();
        let started = started.clone();
        handle.dispatch(move |proactor| {
            let fast = fast.clone();
            let slow = slow.clone();

            let fast_id = proactor.add_periodic(Duration::from_millis(5), move || {
                fast.fetch_add(1, Ordering::SeqCst);
            });
            let slow_id = proactor.add_periodic(Duration::from_millis(50), move || {
                slow.fetch_add(1, Ordering::SeqCst);
            });

            ids.store(fast_id << 32 | slow_id, Ordering::SeqCst);
            started.store(true, Ordering::SeqCst);
        });
    }

    wait_for(Duration::from_secs(1), || started.load(Ordering::SeqCst));
    thread::sleep(Duration::from_millis(120));

    let done = Arc::new(AtomicBool::new(false));
    {
        let ids = ids.clone();
        let done = done.clone();
        handle.dispatch(move |proactor| {
            let packed = ids.load(Ordering::SeqCst);
            proactor.cancel_periodic(packed >> 32);
            proactor.cancel_periodic(packed & 0xffff_ffff);
            done.store(true, Ordering::SeqCst);
        });
    }
    wait_for(Duration::from_secs(1), || done.load(Ordering::SeqCst));

    let fast_count = fast.load(Ordering::SeqCst);
    let slow_count = slow.load(Ordering::SeqCst);

    assert!(fast_count >= 15, "5ms timer fired only {fast_count} times in 120ms");
    assert!(
        (1..=4).contains(&slow_count),
        "50ms timer fired {slow_count} times in 120ms"
    );

    handle.stop();
    join.join().unwrap();
}
