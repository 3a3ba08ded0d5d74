//! Integration tests for watchdog preemption

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tasklet_core::{RunFlags, RunOutcome, Scheduler, SchedulerConfig, TaskletState};

fn counting_hook(sched: &Scheduler, interval: u32) -> Arc<AtomicUsize> {
    let fired = Arc::new(AtomicUsize::new(0));
    let seen = fired.clone();
    sched.set_interrupt(interval, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        true
    });
    fired
}

#[test]
fn test_interval_from_config() {
    let sched = Scheduler::new(SchedulerConfig::default().with_interval(7));
    assert_eq!(sched.interval(), 7);
    sched.set_interval(0);
    assert_eq!(sched.interval(), 0);
}

#[test]
fn test_interrupt_preempts_long_running_tasklet() {
    let sched = Scheduler::default();
    let fired = counting_hook(&sched, 5);
    let log = Arc::new(Mutex::new(Vec::new()));

    let seen = log.clone();
    let t = sched
        .spawn(move |h| {
            for i in 0..10 {
                h.tick()?;
                seen.lock().push(i);
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(
        sched.run(RunFlags::NONE).unwrap(),
        RunOutcome::Interrupted(t)
    );
    assert_eq!(*log.lock(), vec![0, 1, 2, 3]);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(sched.runcount(), 1);
    assert_eq!(sched.interrupted(), Some(t));
    assert_eq!(sched.tasklet(t).unwrap().state, TaskletState::Scheduled);
    assert_eq!(sched.stats().interrupts, 1);

    // The next pass resumes the tasklet right after its tick
    sched.clear_interrupt();
    assert_eq!(sched.run(RunFlags::NONE).unwrap(), RunOutcome::Drained);
    assert_eq!(log.lock().len(), 10);
    assert_eq!(sched.interrupted(), None);
}

#[test]
fn test_hook_may_decline() {
    let sched = Scheduler::default();
    let offered = Arc::new(AtomicUsize::new(0));
    let seen = offered.clone();
    sched.set_interrupt(2, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        false
    });

    sched
        .spawn(|h| {
            for _ in 0..6 {
                assert!(!h.tick()?);
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(sched.run(RunFlags::NONE).unwrap(), RunOutcome::Drained);
    assert_eq!(offered.load(Ordering::SeqCst), 3);
    assert_eq!(sched.stats().interrupts, 0);
}

#[test]
fn test_atomic_region_defers_interrupt() {
    let sched = Scheduler::default();
    let fired = counting_hook(&sched, 2);
    let log = Arc::new(Mutex::new(Vec::new()));

    let seen = log.clone();
    sched
        .spawn(move |h| {
            h.set_atomic(true)?;
            for i in 0..5 {
                assert!(!h.tick()?);
                seen.lock().push(i);
            }
            h.set_atomic(false)?;
            let preempted = h.tick()?;
            seen.lock().push(if preempted { 100 } else { 200 });
            Ok(())
        })
        .unwrap();

    let outcome = sched.run(RunFlags::NONE).unwrap();
    assert!(matches!(outcome, RunOutcome::Interrupted(_)));
    assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    assert_eq!(sched.run(RunFlags::NONE).unwrap(), RunOutcome::Drained);
    assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4, 100]);
}

#[test]
fn test_no_soft_interrupt_suppresses_watchdog() {
    let sched = Scheduler::default();
    let fired = counting_hook(&sched, 1);

    sched
        .spawn(|h| {
            for _ in 0..10 {
                h.tick()?;
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(
        sched.run(RunFlags::NO_SOFT_INTERRUPT).unwrap(),
        RunOutcome::Drained
    );
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_continue_on_interrupt_keeps_running() {
    let sched = Scheduler::default();
    let fired = counting_hook(&sched, 2);
    let log = Arc::new(Mutex::new(Vec::new()));

    for n in 0..2u32 {
        let seen = log.clone();
        sched
            .spawn(move |h| {
                for i in 0..3u32 {
                    h.tick()?;
                    seen.lock().push((n, i));
                }
                Ok(())
            })
            .unwrap();
    }

    assert_eq!(
        sched.run(RunFlags::CONTINUE_ON_INTERRUPT).unwrap(),
        RunOutcome::Drained
    );
    assert_eq!(log.lock().len(), 6);
    assert!(fired.load(Ordering::SeqCst) >= 2);
    assert_eq!(sched.nesting_level(), 0);
}

#[test]
fn test_switch_restarts_countdown() {
    let sched = Scheduler::default();
    let fired = counting_hook(&sched, 3);

    for _ in 0..2 {
        sched
            .spawn(|h| {
                for _ in 0..2 {
                    h.tick()?;
                    h.yield_now()?;
                }
                Ok(())
            })
            .unwrap();
    }

    assert_eq!(sched.run(RunFlags::NONE).unwrap(), RunOutcome::Drained);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn test_interrupt_with_nothing_else_runnable_is_not_recorded() {
    let sched = Scheduler::default();
    let fired = counting_hook(&sched, 1);

    assert!(!sched.tick().unwrap());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(sched.interrupted(), None);
    assert_eq!(sched.stats().interrupts, 0);
    assert_eq!(sched.stats().switches, 0);
    assert_eq!(sched.current(), sched.main());
    assert_eq!(sched.runcount(), 0);
}

#[test]
fn test_lone_tasklet_keeps_running_through_interrupts() {
    let sched = Scheduler::default();
    let fired = counting_hook(&sched, 1);
    let preempted = Arc::new(AtomicUsize::new(0));

    let seen = preempted.clone();
    sched
        .spawn(move |h| {
            for _ in 0..4 {
                if h.tick()? {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(
        sched.run(RunFlags::CONTINUE_ON_INTERRUPT).unwrap(),
        RunOutcome::Drained
    );
    assert_eq!(fired.load(Ordering::SeqCst), 4);
    assert_eq!(preempted.load(Ordering::SeqCst), 0);
    assert_eq!(sched.interrupted(), None);
    assert_eq!(sched.stats().interrupts, 0);
}

#[test]
fn test_teardown_forgets_interrupted_tasklet() {
    let sched = Scheduler::default();
    let _fired = counting_hook(&sched, 2);
    let t = sched
        .spawn(|h| loop {
            h.tick()?;
        })
        .unwrap();

    assert_eq!(
        sched.run(RunFlags::NONE).unwrap(),
        RunOutcome::Interrupted(t)
    );
    assert_eq!(sched.interrupted(), Some(t));

    sched.clear_interrupt();
    sched.teardown().unwrap();
    assert_eq!(sched.interrupted(), None);
    assert_eq!(sched.tasklet(t).unwrap().state, TaskletState::Dead);
}
