//! Integration tests for synchronous channels

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use tasklet_core::{
    Channel, Invariant, RunFlags, RunOutcome, SchedError, Scheduler, SchedulerConfig,
};

#[test]
fn test_ping_pong() {
    let sched = Scheduler::default();
    let ch: Channel<u32> = Channel::new();
    let received = Arc::new(Mutex::new(Vec::new()));

    let rx = ch.clone();
    let seen = received.clone();
    sched
        .spawn(move |h| {
            for _ in 0..3 {
                let value = rx.receive(h)?;
                seen.lock().push(value);
            }
            Ok(())
        })
        .unwrap();

    let tx = ch.clone();
    sched
        .spawn(move |h| {
            for value in 1..=3 {
                tx.send(h, value)?;
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(sched.run(RunFlags::NONE).unwrap(), RunOutcome::Drained);
    assert_eq!(*received.lock(), vec![1, 2, 3]);
    assert_eq!(ch.balance(), 0);
    assert_eq!(sched.blocked_count(), 0);
}

#[test]
fn test_waiting_receiver_shows_in_balance() {
    let sched = Scheduler::default();
    let ch: Channel<&'static str> = Channel::new();
    let received = Arc::new(Mutex::new(None));

    let rx = ch.clone();
    let seen = received.clone();
    let receiver = sched
        .spawn(move |h| {
            *seen.lock() = Some(rx.receive(h)?);
            Ok(())
        })
        .unwrap();

    assert_eq!(
        sched.run(RunFlags::SINGLE_STEP).unwrap(),
        RunOutcome::Drained
    );
    assert_eq!(ch.balance(), -1);
    assert!(sched.tasklet(receiver).unwrap().blocked());

    assert_eq!(ch.try_send("hello"), Ok(()));
    assert_eq!(ch.balance(), 0);
    assert!(sched.tasklet(receiver).unwrap().scheduled());

    sched.run(RunFlags::NONE).unwrap();
    assert_eq!(*received.lock(), Some("hello"));
}

#[test]
fn test_waiting_sender_hands_over_to_main() {
    let sched = Scheduler::default();
    let ch: Channel<u64> = Channel::new();

    let tx = ch.clone();
    sched
        .spawn(move |h| {
            tx.send(h, 42)?;
            Ok(())
        })
        .unwrap();
    sched.run(RunFlags::NONE).unwrap();
    assert_eq!(ch.balance(), 1);

    assert_eq!(ch.receive(&sched).unwrap(), 42);
    assert_eq!(ch.balance(), 0);
    assert_eq!(sched.runcount(), 1);
    assert_eq!(sched.run(RunFlags::NONE).unwrap(), RunOutcome::Drained);
    assert_eq!(sched.stats().tasklets_finished, 1);
}

#[test]
fn test_block_trap_rejects_blocking() {
    let sched = Scheduler::default();
    let ch: Channel<u32> = Channel::new();
    let result = Arc::new(Mutex::new(None));

    let rx = ch.clone();
    let seen = result.clone();
    sched
        .spawn(move |h| {
            h.set_block_trap(true)?;
            let err = rx.receive(h).unwrap_err();
            *seen.lock() = Some(matches!(err, SchedError::BlockTrap));
            Ok(())
        })
        .unwrap();

    sched.run(RunFlags::NONE).unwrap();
    assert_eq!(*result.lock(), Some(true));
    assert_eq!(ch.balance(), 0);
}

#[test]
fn test_block_trap_allows_immediate_rendezvous() {
    let sched = Scheduler::default();
    let ch: Channel<u32> = Channel::new();

    let tx = ch.clone();
    sched
        .spawn(move |h| {
            tx.send(h, 7)?;
            Ok(())
        })
        .unwrap();
    sched.run(RunFlags::NONE).unwrap();

    sched.set_block_trap(true).unwrap();
    assert_eq!(ch.receive(&sched).unwrap(), 7);
}

#[test]
fn test_lone_receiver_deadlocks() {
    let sched = Scheduler::default();
    let ch: Channel<u32> = Channel::new();
    assert!(matches!(ch.receive(&sched), Err(SchedError::Deadlock)));
    assert!(matches!(ch.send(&sched, 1), Err(SchedError::Deadlock)));
    assert_eq!(ch.balance(), 0);
}

#[test]
fn test_killed_receiver_leaves_channel() {
    let sched = Scheduler::default();
    let ch: Channel<u32> = Channel::new();

    let rx = ch.clone();
    let receiver = sched
        .spawn(move |h| {
            rx.receive(h)?;
            Ok(())
        })
        .unwrap();
    sched.run(RunFlags::NONE).unwrap();
    assert_eq!(ch.balance(), -1);

    sched.kill(receiver).unwrap();
    assert_eq!(ch.balance(), 0);
    assert_eq!(ch.try_send(1), Err(1));
}

#[test]
fn test_teardown_releases_waiters() {
    let ch: Channel<String> = Channel::new();
    {
        let sched = Scheduler::default();
        for n in 0..3 {
            let tx = ch.clone();
            sched
                .spawn(move |h| {
                    tx.send(h, format!("message {n}"))?;
                    Ok(())
                })
                .unwrap();
        }
        sched.run(RunFlags::NONE).unwrap();
        assert_eq!(ch.balance(), 3);
        assert_eq!(sched.blocked_count(), 3);
        sched.teardown().unwrap();
    }
    assert_eq!(ch.balance(), 0);
}

#[test]
fn test_rendezvous_across_threads() {
    let ch: Channel<u32> = Channel::new();
    let config = SchedulerConfig::default().with_thread_block(true);

    let rx = ch.clone();
    let rx_config = config.clone();
    let receiver = thread::spawn(move || {
        let sched = Scheduler::new(rx_config);
        let received = Arc::new(Mutex::new(Vec::new()));
        let seen = received.clone();
        sched
            .spawn(move |h| {
                for _ in 0..5 {
                    let value = rx.receive(h)?;
                    seen.lock().push(value);
                }
                Ok(())
            })
            .unwrap();
        let outcome = sched.run(RunFlags::NONE).unwrap();
        let received = received.lock().clone();
        (outcome, received)
    });

    let sched = Scheduler::new(config);
    let tx = ch.clone();
    sched
        .spawn(move |h| {
            for value in 0..5 {
                tx.send(h, value)?;
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(sched.run(RunFlags::NONE).unwrap(), RunOutcome::Drained);

    let (outcome, received) = receiver.join().unwrap();
    assert_eq!(outcome, RunOutcome::Drained);
    assert_eq!(received, vec![0, 1, 2, 3, 4]);
    assert_eq!(ch.balance(), 0);
}

#[test]
fn test_send_error_reaches_waiting_receiver() {
    let sched = Scheduler::default();
    let ch: Channel<u32> = Channel::new();
    let caught = Arc::new(Mutex::new(None));

    let rx = ch.clone();
    let seen = caught.clone();
    let a = sched
        .spawn(move |h| {
            match rx.receive(h) {
                Err(SchedError::Thrown(err)) => *seen.lock() = Some(err.to_string()),
                other => panic!("unexpected receive result {other:?}"),
            }
            Ok(())
        })
        .unwrap();
    sched.run(RunFlags::NONE).unwrap();
    assert_eq!(ch.balance(), -1);

    // a receiver is waiting, so the sender does not switch
    ch.send_error(&sched, anyhow::anyhow!("not implemented"))
        .unwrap();
    assert!(sched.tasklet(a).unwrap().scheduled());
    assert_eq!(sched.current(), sched.main());

    assert_eq!(sched.run(RunFlags::NONE).unwrap(), RunOutcome::Drained);
    assert_eq!(caught.lock().as_deref(), Some("not implemented"));
    assert_eq!(ch.balance(), 0);
}

#[test]
fn test_blocked_sender_passes_error() {
    let sched = Scheduler::default();
    let ch: Channel<u32> = Channel::new();

    let tx = ch.clone();
    sched
        .spawn(move |h| {
            tx.send_error(h, anyhow::anyhow!("lookup failed").context("resolving"))?;
            Ok(())
        })
        .unwrap();

    match ch.receive(&sched) {
        Err(SchedError::Thrown(err)) => assert_eq!(format!("{err:#}"), "resolving: lookup failed"),
        other => panic!("unexpected receive result {other:?}"),
    }
    assert_eq!(ch.balance(), 0);
    assert_eq!(sched.run(RunFlags::NONE).unwrap(), RunOutcome::Drained);
}

#[test]
fn test_try_receive_takes_error() {
    let sched = Scheduler::default();
    let ch: Channel<u32> = Channel::new();

    let tx = ch.clone();
    sched
        .spawn(move |h| {
            tx.send_error(h, anyhow::anyhow!("closed"))?;
            Ok(())
        })
        .unwrap();
    sched.run(RunFlags::NONE).unwrap();
    assert_eq!(ch.balance(), 1);

    match ch.try_receive() {
        Some(Err(SchedError::Thrown(err))) => assert_eq!(err.to_string(), "closed"),
        other => panic!("unexpected try_receive result {other:?}"),
    }
    assert!(ch.try_receive().is_none());
    assert_eq!(sched.run(RunFlags::NONE).unwrap(), RunOutcome::Drained);
}

#[test]
fn test_switch_trap_rejects_blocking_send_error() {
    let sched = Scheduler::default();
    let ch: Channel<u32> = Channel::new();
    let caught = Arc::new(Mutex::new(None));

    let rx = ch.clone();
    let seen = caught.clone();
    sched
        .spawn(move |h| {
            let err = rx.receive(h).unwrap_err();
            *seen.lock() = Some(matches!(err, SchedError::Thrown(_)));
            Ok(())
        })
        .unwrap();

    {
        let _trap = sched.trap_switches();
        let err = ch
            .send_error(&sched, anyhow::anyhow!("not implemented"))
            .unwrap_err();
        assert_eq!(err.invariant(), Some(Invariant::SwitchTrapped));
        assert_eq!(ch.balance(), 0);
        assert_eq!(sched.runcount(), 1);
    }

    ch.send_error(&sched, anyhow::anyhow!("not implemented"))
        .unwrap();
    assert_eq!(*caught.lock(), Some(true));
    assert_eq!(ch.balance(), 0);
}
