mod common;

use covenant::{CovenantError, RetryCause, TransactionId};
use rand::Rng;
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use common::{committed_local_object, decode, encode, setup_covenant};

#[test]
fn test_waiter_wakes_when_holder_aborts() {
    let covenant = setup_covenant();
    let object = committed_local_object(&covenant, b"free");
    let barrier = Arc::new(Barrier::new(2));

    // Thread 1 takes the write lock, holds it for a while and aborts.
    let c1 = covenant.clone();
    let obj1 = object.clone();
    let b1 = barrier.clone();
    let holder = thread::spawn(move || {
        let mut tm = c1.transaction_manager();
        tm.start_transaction().unwrap();
        obj1.set(&mut tm, b"held".to_vec()).unwrap();
        println!("Holder: write lock taken");
        b1.wait();
        thread::sleep(Duration::from_millis(300));
        tm.abort_transaction().unwrap();
        println!("Holder: aborted");
    });

    // Main thread blocks on the same object.
    barrier.wait();
    let mut tm = covenant.transaction_manager();
    let tid = tm.start_transaction().unwrap();
    let started = Instant::now();
    tm.register_write(&object).unwrap();
    let waited = started.elapsed();
    println!("Waiter: acquired write lock after {:?}", waited);

    // Woken by the abort, well before the long poll would have ended.
    assert!(waited >= Duration::from_millis(200), "waited only {:?}", waited);
    assert!(waited < Duration::from_millis(900), "waited {:?}", waited);
    assert_eq!(object.payload(), b"free".to_vec());
    assert_eq!(object.write_lock_holder(), Some(tid));
    assert!(tm.current_log().unwrap().stats().lock_waits() >= 1);

    object.set(&mut tm, b"waiter".to_vec()).unwrap();
    tm.commit_transaction().unwrap();
    holder.join().unwrap();
    assert_eq!(object.payload(), b"waiter".to_vec());
    assert_eq!(object.version(), 2);
}

#[test]
fn test_retry_signal_wakes_lock_waiter() {
    let covenant = setup_covenant();
    let object = committed_local_object(&covenant, b"free");

    let mut holder = covenant.transaction_manager();
    holder.start_transaction().unwrap();
    object.set(&mut holder, b"held".to_vec()).unwrap();

    let (tid_tx, tid_rx) = mpsc::channel();
    let c1 = covenant.clone();
    let obj1 = object.clone();
    let waiter = thread::spawn(move || {
        let mut tm = c1.transaction_manager();
        let tid = tm.start_transaction().unwrap();
        tid_tx.send(tid.clone()).unwrap();
        let result = tm.register_write(&obj1);
        let returned_at = Instant::now();
        match result {
            Err(CovenantError::TransactionRestarting { tid: restarted }) => {
                assert_eq!(restarted, tid)
            }
            other => panic!("Expected TransactionRestarting, got {:?}", other),
        }
        assert!(!tm.in_transaction());
        returned_at
    });

    let tid = tid_rx.recv().unwrap();
    // Past the short first wait, into the long poll.
    thread::sleep(Duration::from_millis(200));
    let signaled_at = Instant::now();
    assert!(covenant.signal_retry(&tid).unwrap());
    let returned_at = waiter.join().unwrap();
    let delay = returned_at.duration_since(signaled_at);
    println!("Waiter restarted {:?} after the signal", delay);
    assert!(delay < Duration::from_millis(500), "restart took {:?}", delay);

    assert_eq!(object.write_lock_holder(), holder.current_tid());
    holder.commit_transaction().unwrap();
    assert_eq!(object.payload(), b"held".to_vec());
}

#[test]
fn test_waiter_wakes_when_holder_commits() {
    let covenant = setup_covenant();
    let object = committed_local_object(&covenant, encode(1).as_slice());
    let barrier = Arc::new(Barrier::new(2));

    let c1 = covenant.clone();
    let obj1 = object.clone();
    let b1 = barrier.clone();
    let holder = thread::spawn(move || {
        let mut tm = c1.transaction_manager();
        tm.start_transaction().unwrap();
        obj1.set(&mut tm, encode(2)).unwrap();
        b1.wait();
        thread::sleep(Duration::from_millis(200));
        tm.commit_transaction().unwrap();
    });

    barrier.wait();
    let mut tm = covenant.transaction_manager();
    tm.start_transaction().unwrap();
    let value = decode(&object.get(&mut tm).unwrap());
    println!("Reader saw {} after the writer committed", value);
    assert_eq!(value, 2);
    tm.commit_transaction().unwrap();
    holder.join().unwrap();
}

#[test]
fn test_deadlock_victim_is_youngest() {
    let covenant = setup_covenant();
    let x = committed_local_object(&covenant, b"x");
    let y = committed_local_object(&covenant, b"y");
    let barrier = Arc::new(Barrier::new(2));
    let (sender, receiver) = mpsc::channel::<(u64, Result<(), CovenantError>)>();

    // Thread A: X then Y. Thread B: Y then X.
    let mut handles = Vec::new();
    for (first, second, name) in [(x.clone(), y.clone(), "A"), (y.clone(), x.clone(), "B")] {
        let c = covenant.clone();
        let b = barrier.clone();
        let sender = sender.clone();
        handles.push(thread::spawn(move || {
            let mut tm = c.transaction_manager();
            let tid = tm.start_transaction().unwrap();
            first.set(&mut tm, name.as_bytes().to_vec()).unwrap();
            b.wait();
            let outcome = second
                .set(&mut tm, name.as_bytes().to_vec())
                .and_then(|()| tm.commit_transaction());
            match &outcome {
                Ok(()) => println!("Thread {}: committed", name),
                Err(e) => println!("Thread {}: {}", name, e),
            }
            assert!(!tm.in_transaction());
            sender.send((tid.top_tid(), outcome)).unwrap();
        }));
    }
    drop(sender);

    let mut survivors = Vec::new();
    let mut victims = Vec::new();
    for _ in 0..2 {
        let (top_tid, outcome) = receiver
            .recv_timeout(Duration::from_secs(10))
            .expect("deadlock was not resolved");
        match outcome {
            Ok(()) => survivors.push(top_tid),
            Err(CovenantError::TransactionRestarting { tid }) => {
                assert_eq!(tid.top_tid(), top_tid);
                assert!(tid.is_top_level());
                victims.push(top_tid);
            }
            Err(e) => panic!("Unexpected error: {:?}", e),
        }
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(survivors.len(), 1, "exactly one transaction commits");
    assert_eq!(victims.len(), 1, "exactly one transaction restarts");
    assert!(victims[0] > survivors[0], "the younger transaction is chosen");
    assert_eq!(x.write_lock_holder(), None);
    assert_eq!(y.write_lock_holder(), None);
    assert_eq!(x.payload(), y.payload());
}

#[test]
fn test_writer_revokes_read_lock() {
    let covenant = setup_covenant();
    let object = committed_local_object(&covenant, b"shared");
    let barrier = Arc::new(Barrier::new(2));

    // The reader holds its read lock until told to retry.
    let c1 = covenant.clone();
    let obj1 = object.clone();
    let b1 = barrier.clone();
    let reader = thread::spawn(move || {
        let mut tm = c1.transaction_manager();
        let tid = tm.start_transaction().unwrap();
        obj1.get(&mut tm).unwrap();
        b1.wait();
        let deadline = Instant::now() + Duration::from_secs(5);
        let signal = loop {
            if let Some(signal) = tm.current_log().unwrap().retry_signal() {
                break signal;
            }
            assert!(Instant::now() < deadline, "reader was never flagged");
            thread::sleep(Duration::from_millis(5));
        };
        let outcome = tm.check_retry_signal();
        (tid, signal, outcome)
    });

    barrier.wait();
    let mut tm = covenant.transaction_manager();
    let writer = tm.start_transaction().unwrap();
    tm.register_write(&object).unwrap();
    println!("Writer acquired the lock once the reader let go");

    // No read lock outside the writer's ancestors survives.
    assert!(
        object
            .read_lock_holders()
            .iter()
            .all(|reader| writer.is_descendant_of(reader))
    );
    object.set(&mut tm, b"written".to_vec()).unwrap();
    tm.commit_transaction().unwrap();

    let (reader_tid, signal, outcome) = reader.join().unwrap();
    assert_eq!(signal.tid, reader_tid);
    assert_eq!(
        signal.cause,
        RetryCause::ReadLockRevoked { by: writer.clone() }
    );
    match outcome {
        Err(CovenantError::TransactionRestarting { tid }) => assert_eq!(tid, reader_tid),
        other => panic!("Expected TransactionRestarting, got {:?}", other),
    }
    assert_eq!(object.payload(), b"written".to_vec());
}

#[test]
fn test_writer_does_not_revoke_ancestor_reads() {
    let covenant = setup_covenant();
    let object = committed_local_object(&covenant, b"mine");
    let mut tm = covenant.transaction_manager();

    let parent = tm.start_transaction().unwrap();
    object.get(&mut tm).unwrap();
    tm.start_transaction().unwrap();
    object.set(&mut tm, b"child".to_vec()).unwrap();

    assert!(tm.current_log().unwrap().retry_signal().is_none());
    assert_eq!(object.read_lock_holders(), vec![parent]);
    tm.commit_transaction().unwrap();
    tm.commit_transaction().unwrap();
    assert_eq!(object.payload(), b"child".to_vec());
}

#[test]
fn test_random_transfers_keep_write_locks_exclusive() {
    const THREADS: usize = 4;
    const TXNS_PER_THREAD: usize = 15;
    const OBJECTS: usize = 4;

    let covenant = setup_covenant();
    let counters: Vec<_> = (0..OBJECTS)
        .map(|_| committed_local_object(&covenant, &encode(0)))
        .collect();
    let barrier = Arc::new(Barrier::new(THREADS));

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let c = covenant.clone();
        let counters = counters.clone();
        let b = barrier.clone();
        handles.push(thread::spawn(move || {
            let mut rng = rand::rng();
            let mut tm = c.transaction_manager();
            b.wait();
            for _ in 0..TXNS_PER_THREAD {
                let first = rng.random_range(0..OBJECTS);
                let second = (first + rng.random_range(1..OBJECTS)) % OBJECTS;
                let hold = Duration::from_micros(rng.random_range(0..500));
                tm.run_in_transaction(|tm| {
                    for index in [first, second] {
                        let counter = &counters[index];
                        tm.register_write(counter)?;
                        let me: Option<TransactionId> = tm.current_tid();
                        assert_eq!(counter.write_lock_holder(), me);
                        assert!(
                            counter
                                .read_lock_holders()
                                .iter()
                                .all(|reader| me.as_ref().is_some_and(|tid| tid.is_descendant_of(reader)))
                        );
                        let value = decode(&counter.payload());
                        thread::sleep(hold);
                        counter.set(tm, encode(value + 1))?;
                    }
                    Ok(())
                })
                .unwrap();
            }
            println!("Thread {} finished", t);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let total: u64 = counters.iter().map(|c| decode(&c.payload())).sum();
    println!("Total increments: {}", total);
    assert_eq!(total, (THREADS * TXNS_PER_THREAD * 2) as u64);
    for counter in &counters {
        assert_eq!(counter.write_lock_holder(), None);
        assert_eq!(counter.history_depth(), 0);
        assert_eq!(counter.version(), 1 + decode(&counter.payload()));
    }
    assert_eq!(covenant.active_transactions(), 0);
}
