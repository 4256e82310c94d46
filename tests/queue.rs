use fulcrum::{BoundedQueue, Error};

use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn test_fifo_order() {
    let queue = BoundedQueue::new(8);

    for i in 0..8 {
        assert!(queue.push(i, false).unwrap());
    }

    for i in 0..8 {
        assert_eq!(queue.pop(), Some(i));
    }
}

#[test]
fn test_occupancy_never_exceeds_capacity() {
    let queue = BoundedQueue::new(3);

    for i in 0..10 {
        queue.push(i, false).unwrap();
        assert!(queue.len() <= 3);

        if i % 2 == 0 {
            queue.pop();
        }
    }
}

#[test]
fn test_nonblocking_push_on_full_queue_fails_without_altering_contents() {
    let queue = BoundedQueue::new(2);

    assert!(queue.push("a", false).unwrap());
    assert!(queue.push("b", false).unwrap());

    assert!(!queue.push("c", false).unwrap());

    assert_eq!(queue.len(), 2);
    assert_eq!(queue.pop(), Some("a"));
    assert_eq!(queue.pop(), Some("b"));
}

#[test]
fn test_blocking_push_completes_after_concurrent_pop() {
    let queue = Arc::new(BoundedQueue::new(2));

    queue.push(1, false).unwrap();
    queue.push(2, false).unwrap();

    let popper = {
        let queue = queue.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            queue.pop()
        })
    };

    // Blocks until the popper frees a slot.
    assert!(queue.push(3, true).unwrap());

    assert_eq!(popper.join().unwrap(), Some(1));
    assert_eq!(queue.pop(), Some(2));
    assert_eq!(queue.pop(), Some(3));
}

#[test]
fn test_push_after_close_fails() {
    let queue = BoundedQueue::new(2);
    queue.push(1, false).unwrap();
    queue.close();

    assert!(matches!(queue.push(2, true), Err(Error::QueueClosed)));
    assert!(matches!(queue.push(2, false), Err(Error::QueueClosed)));
}

#[test]
fn test_pop_drains_then_returns_none_after_close() {
    let queue = BoundedQueue::new(4);
    queue.push(1, false).unwrap();
    queue.push(2, false).unwrap();
    queue.close();

    assert_eq!(queue.pop(), Some(1));
    assert_eq!(queue.pop(), Some(2));
    assert_eq!(queue.pop(), None);
}

#[test]
fn test_close_wakes_blocked_pop() {
    let queue: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(4));

    let consumer = {
        let queue = queue.clone();
        thread::spawn(move || queue.pop())
    };

    thread::sleep(Duration::from_millis(100));
    queue.close();

    assert_eq!(consumer.join().unwrap(), None);
}

#[test]
fn test_close_wakes_blocked_push() {
    let queue = Arc::new(BoundedQueue::new(1));
    queue.push(1, false).unwrap();

    let producer = {
        let queue = queue.clone();
        thread::spawn(move || queue.push(2, true))
    };

    thread::sleep(Duration::from_millis(100));
    queue.close();

    assert!(matches!(producer.join().unwrap(), Err(Error::QueueClosed)));
}

#[test]
fn test_unbounded_degenerate_capacity() {
    let queue = BoundedQueue::new(0);

    for i in 0..1000 {
        assert!(queue.push(i, false).unwrap());
    }

    assert_eq!(queue.len(), 1000);
    assert_eq!(queue.pop(), Some(0));
}
