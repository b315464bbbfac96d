use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use ensemble_bus::message::{Arg, Message};
use ensemble_bus::Ensemble;

#[test]
fn local_handler_service_receives_sent_messages() {
    let _ = env_logger::try_init();
    let mut bus = Ensemble::new("test-ensemble").unwrap();

    let received = Rc::new(RefCell::new(Vec::new()));
    let received_clone = received.clone();
    bus.service_new_handler(
        "echo",
        Box::new(move |msg: &Message| {
            received_clone.borrow_mut().push(msg.address.clone());
            Ok(())
        }),
    )
    .unwrap();

    bus.send(Message::new("/echo/ping", 0.0, vec![Arg::Int32(1)])).unwrap();
    bus.send(Message::new("/echo/pong", 0.0, vec![])).unwrap();

    assert_eq!(*received.borrow(), vec!["/echo/ping".to_string(), "/echo/pong".to_string()]);
}

#[test]
fn sending_to_an_unknown_service_is_an_error() {
    let _ = env_logger::try_init();
    let mut bus = Ensemble::new("test-ensemble").unwrap();
    let err = bus.send(Message::new("/nosuch/leaf", 0.0, vec![]));
    assert!(err.is_err());
}

#[test]
fn clock_set_makes_the_process_its_own_reference() {
    let _ = env_logger::try_init();
    let mut bus = Ensemble::new("test-ensemble").unwrap();
    assert!(!bus.is_clock_synchronized());
    bus.clock_set();
    assert!(bus.is_clock_synchronized());
}

#[test]
fn methods_dispatch_through_the_path_tree_by_address() {
    let _ = env_logger::try_init();
    let mut bus = Ensemble::new("test-ensemble").unwrap();
    bus.service_new("mixer").unwrap();

    let gain_calls: Rc<RefCell<Vec<f64>>> = Rc::new(RefCell::new(Vec::new()));
    let gain_calls_clone = gain_calls.clone();
    bus.method_new(
        "mixer",
        "/gain",
        Rc::new(RefCell::new(move |msg: &Message| {
            if let Some(arg) = msg.args.first() {
                gain_calls_clone.borrow_mut().push(arg.as_f64()?);
            }
            Ok(())
        })),
    );

    bus.send(Message::new("/mixer/gain", 0.0, vec![Arg::Double(0.75)])).unwrap();
    assert_eq!(*gain_calls.borrow(), vec![0.75]);
}

#[test]
fn future_timestamped_message_is_delivered_only_after_poll_catches_up() {
    let _ = env_logger::try_init();
    let mut bus = Ensemble::new("test-ensemble").unwrap();

    let received = Rc::new(RefCell::new(false));
    let received_clone = received.clone();
    bus.service_new_handler(
        "metronome",
        Box::new(move |_msg: &Message| {
            *received_clone.borrow_mut() = true;
            Ok(())
        }),
    )
    .unwrap();

    // A send scheduled well in the future should not fire immediately.
    bus.send(Message::new("/metronome/tick", 5.0, vec![])).unwrap();
    assert!(!*received.borrow());

    // Polling with a short timeout repeatedly should still not surface the
    // future message before its deadline; this only checks it doesn't fire
    // early, not that it fires on time (that's covered by the scheduler's
    // own unit tests).
    for _ in 0..3 {
        bus.poll(Some(Duration::from_millis(1))).unwrap();
    }
    assert!(!*received.borrow());
}
