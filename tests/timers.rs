use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

use wheelio::{EventLoop, Timer};

fn drive(lp: &mut EventLoop, done: &Rc<Cell<bool>>) {
    let started = Instant::now();
    while !done.get() {
        assert!(started.elapsed().as_secs() < 10, "test timed out");
        lp.run_once().unwrap();
    }
}

#[test]
fn one_shot_fires_after_its_deadline() {
    let started = Instant::now();
    let mut lp = EventLoop::new();

    let fired = Rc::new(Cell::new(false));
    let flag = fired.clone();

    let timer = Timer::new();
    timer.start(&mut lp, move |_, _| flag.set(true), 30, 0);
    assert!(timer.is_active());

    drive(&mut lp, &fired);

    assert!(started.elapsed().as_millis() >= 30);
    assert!(!timer.is_active());
}

#[test]
fn repeating_timer_stops_itself_after_three_firings() {
    let mut lp = EventLoop::new();

    let count = Rc::new(Cell::new(0u32));
    let counter = count.clone();

    let timer = Timer::new();
    timer.start(
        &mut lp,
        move |lp, timer| {
            counter.set(counter.get() + 1);
            if counter.get() == 3 {
                timer.stop(lp);
            }
        },
        15,
        15,
    );

    let settled = Rc::new(Cell::new(false));
    let flag = settled.clone();
    Timer::new().start(&mut lp, move |_, _| flag.set(true), 150, 0);

    drive(&mut lp, &settled);

    assert_eq!(3, count.get());
    assert!(!timer.is_active());
}

#[test]
fn stopped_timer_never_fires() {
    let mut lp = EventLoop::new();

    let fired = Rc::new(Cell::new(false));
    let flag = fired.clone();

    let timer = Timer::new();
    timer.start(&mut lp, move |_, _| flag.set(true), 20, 0);
    timer.stop(&mut lp);

    let settled = Rc::new(Cell::new(false));
    let settle_flag = settled.clone();
    Timer::new().start(&mut lp, move |_, _| settle_flag.set(true), 60, 0);

    drive(&mut lp, &settled);
    assert!(!fired.get());
}

#[test]
fn again_reschedules_at_the_repeat_interval() {
    let mut lp = EventLoop::new();
    let started = Instant::now();

    let fired = Rc::new(Cell::new(false));
    let flag = fired.clone();

    let timer = Timer::new();
    timer.start(
        &mut lp,
        move |lp, timer| {
            flag.set(true);
            timer.stop(lp);
        },
        5_000,
        20,
    );
    timer.again(&mut lp).unwrap();

    drive(&mut lp, &fired);
    assert!(started.elapsed().as_millis() < 1_000);
}

#[test]
fn next_timeout_reflects_the_nearest_deadline() {
    let mut lp = EventLoop::new();
    assert_eq!(None, lp.next_timeout());

    let timer = Timer::new();
    timer.start(&mut lp, |_, _| {}, 40, 0);
    assert_eq!(Some(40), lp.next_timeout());

    timer.stop(&mut lp);
    assert_eq!(None, lp.next_timeout());
}
