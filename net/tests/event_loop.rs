//! Loop mechanics: task ordering, in-loop execution, context, free
//! slots, quit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flywheel_net::{EventLoop, LoopHandle};

fn spawn_loop(name: &str) -> (LoopHandle, std::thread::JoinHandle<()>) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let join = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let mut event_loop = EventLoop::new().unwrap();
            tx.send(event_loop.handle()).unwrap();
            event_loop.run().unwrap();
        })
        .unwrap();
    (rx.recv().unwrap(), join)
}

#[test]
fn test_tasks_from_one_thread_run_in_fifo_order() {
    let (handle, join) = spawn_loop("fifo");
    let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    for tag in 0..100u32 {
        let order = order.clone();
        handle.queue_in_loop(move || {
            order.lock().unwrap().push(tag);
        });
    }

    for _ in 0..100 {
        if order.lock().unwrap().len() == 100 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());

    handle.quit();
    join.join().unwrap();
}

#[test]
fn test_run_in_loop_is_synchronous_on_loop_thread() {
    let (handle, join) = spawn_loop("sync");
    let (tx, rx) = crossbeam_channel::bounded(1);
    {
        let handle2 = handle.clone();
        handle.queue_in_loop(move || {
            let flag = Arc::new(AtomicBool::new(false));
            let flag2 = flag.clone();
            handle2.run_in_loop(move || flag2.store(true, Ordering::SeqCst));
            // Executed inline, not queued.
            let _ = tx.send(flag.load(Ordering::SeqCst));
        });
    }
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());

    handle.quit();
    join.join().unwrap();
}

#[test]
fn test_task_posted_from_task_runs_in_later_drain() {
    let (handle, join) = spawn_loop("nested-task");
    let (tx, rx) = crossbeam_channel::bounded(1);
    {
        let handle2 = handle.clone();
        handle.queue_in_loop(move || {
            let tx = tx.clone();
            handle2.queue_in_loop(move || {
                let _ = tx.send(());
            });
        });
    }
    // The nested task must still run without further external wake-ups.
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    handle.quit();
    join.join().unwrap();
}

#[test]
fn test_iteration_counter_advances() {
    let (handle, join) = spawn_loop("iteration");
    let before = handle.iteration();
    // Each queued task forces at least one loop iteration.
    for _ in 0..3 {
        let (tx, rx) = crossbeam_channel::bounded(1);
        handle.queue_in_loop(move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
    assert!(handle.iteration() > before);

    handle.quit();
    join.join().unwrap();
}

#[test]
fn test_context_roundtrip() {
    let (handle, join) = spawn_loop("context");

    #[derive(Debug, PartialEq)]
    struct ServerTag(u64);

    handle.set_context(ServerTag(77));
    let value = handle.with_context(|tag: &mut ServerTag| tag.0);
    assert_eq!(value, Some(77));

    // Wrong type reads as None.
    assert_eq!(handle.with_context(|v: &mut String| v.clone()), None);

    handle.clear_context();
    assert_eq!(handle.with_context(|tag: &mut ServerTag| tag.0), None);

    handle.quit();
    join.join().unwrap();
}

#[test]
fn test_free_slots_replenish() {
    let (handle, join) = spawn_loop("free-slots");

    let first = handle.take_free_tcp_slot();
    assert!(first.is_some(), "loop seeded without a free TCP slot");

    // Replenishment is queued on the loop thread.
    let mut second = None;
    for _ in 0..100 {
        second = handle.take_free_tcp_slot();
        if second.is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    let second = second.expect("TCP slot never replenished");
    assert_ne!(first.unwrap(), second);

    assert!(handle.take_free_udp_slot().is_some());

    handle.quit();
    join.join().unwrap();
}

#[test]
fn test_quit_stops_the_loop() {
    let (handle, join) = spawn_loop("quit");
    handle.quit();
    join.join().unwrap();
    // Tasks posted after the loop stopped are accepted but never run.
    handle.queue_in_loop(|| panic!("task ran on a stopped loop"));
}

#[test]
fn test_one_loop_per_thread_is_enforced() {
    let result = std::thread::spawn(|| {
        let _first = EventLoop::new().unwrap();
        let second = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = EventLoop::new();
        }));
        second.is_err()
    })
    .join()
    .unwrap();
    assert!(result, "second loop on one thread did not panic");
}

#[test]
fn test_current_loop_is_visible_on_loop_thread() {
    let (handle_tx, handle_rx) = crossbeam_channel::bounded(1);
    let (tx, rx) = crossbeam_channel::bounded(1);
    let join = std::thread::spawn(move || {
        let mut event_loop = EventLoop::new().unwrap();
        let _ = handle_tx.send(event_loop.handle());
        event_loop.queue_in_loop(move || {
            let _ = tx.send(EventLoop::current().is_some());
        });
        event_loop.run().unwrap();
    });

    let handle = handle_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    // Off-thread there is no current loop.
    assert!(EventLoop::current().is_none());

    handle.quit();
    join.join().unwrap();
}
