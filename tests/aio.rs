use std::cell::Cell;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom};
use std::rc::Rc;

use assert_matches::assert_matches;
use rand::{thread_rng, Rng};

use helpers::*;
use wheelio::{AioHandle, EventLoop, FsRequest, IoBuf, SubmitError, Timer, WriteFlags};

pub mod helpers;

const PAGE: usize = 8192;

/// The usual consumer: feed every completion count straight back into
/// the loop's drain.
fn fan_out_handle(lp: &mut EventLoop) -> AioHandle {
    AioHandle::new(lp, |lp, count| lp.process_completions(count)).unwrap()
}

#[test]
fn read_fills_buffer_and_reports_byte_count() {
    let (dir, path) = create_filled_tempfile(FILE_SIZE);
    let file = OpenOptions::new().read(true).open(&path).unwrap();

    let mut lp = EventLoop::new();
    let handle = fan_out_handle(&mut lp);

    let done = Rc::new(Cell::new(false));
    let flag = done.clone();

    let req = FsRequest::read(&file, 4096, vec![IoBuf::with_size(PAGE)], move |_, req| {
        assert_eq!(PAGE as u64, req.result().unwrap());
        let bufs = req.into_bufs();
        assert_eq!(pattern(4096, PAGE).as_slice(), bufs[0].as_ref());
        flag.set(true);
    });
    handle.submit(&mut lp, req).unwrap();

    drive_until(&mut lp, &done);

    handle.close(&mut lp);
    dir.close().unwrap();
}

#[test]
fn vectored_read_completes_once_with_summed_result() {
    let (dir, path) = create_filled_tempfile(FILE_SIZE);
    let file = OpenOptions::new().read(true).open(&path).unwrap();

    let mut lp = EventLoop::new();
    let handle = fan_out_handle(&mut lp);

    let fired = Rc::new(Cell::new(0u32));
    let done = Rc::new(Cell::new(false));

    let counter = fired.clone();
    let flag = done.clone();
    let bufs = vec![IoBuf::with_size(4096), IoBuf::with_size(4096)];

    let req = FsRequest::read(&file, 0, bufs, move |_, req| {
        counter.set(counter.get() + 1);
        assert_eq!(8192, req.result().unwrap());

        let bufs = req.into_bufs();
        assert_eq!(pattern(0, 4096).as_slice(), bufs[0].as_ref());
        assert_eq!(pattern(4096, 4096).as_slice(), bufs[1].as_ref());
        flag.set(true);
    });
    handle.submit(&mut lp, req).unwrap();

    drive_until(&mut lp, &done);

    // Give any stray duplicate delivery a chance to surface.
    let settled = Rc::new(Cell::new(false));
    let settle_flag = settled.clone();
    Timer::new().start(&mut lp, move |_, _| settle_flag.set(true), 50, 0);
    drive_until(&mut lp, &settled);

    assert_eq!(1, fired.get());

    handle.close(&mut lp);
    dir.close().unwrap();
}

#[test]
fn submit_rejects_bad_buffer_counts() {
    let (dir, path) = create_filled_tempfile(PAGE);
    let file = OpenOptions::new().read(true).open(&path).unwrap();

    let mut lp = EventLoop::new();
    let handle = fan_out_handle(&mut lp);

    let empty = FsRequest::read(&file, 0, Vec::new(), |_, _| panic!("must not fire"));
    assert_matches!(
        handle.submit(&mut lp, empty),
        Err(SubmitError::InvalidBufferCount(0))
    );

    let oversized_bufs = (0..65).map(|_| IoBuf::with_size(16)).collect();
    let oversized = FsRequest::read(&file, 0, oversized_bufs, |_, _| panic!("must not fire"));
    assert_matches!(
        handle.submit(&mut lp, oversized),
        Err(SubmitError::InvalidBufferCount(65))
    );

    handle.close(&mut lp);
    dir.close().unwrap();
}

#[test]
fn vectored_write_lays_buffers_out_sequentially() {
    let (dir, path) = create_filled_tempfile(FILE_SIZE);
    let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();

    let mut lp = EventLoop::new();
    let handle = fan_out_handle(&mut lp);

    let done = Rc::new(Cell::new(false));
    let flag = done.clone();

    let bufs = vec![
        IoBuf::from(vec![0x41u8; 4096]),
        IoBuf::from(vec![0x42u8; 4096]),
        IoBuf::from(vec![0x43u8; 4096]),
    ];
    let req = FsRequest::write(&file, 16384, bufs, move |_, req| {
        assert_eq!(3 * 4096, req.result().unwrap());
        flag.set(true);
    })
    .write_flags(WriteFlags::DSYNC);
    handle.submit(&mut lp, req).unwrap();

    drive_until(&mut lp, &done);

    let mut readback = std::fs::File::open(&path).unwrap();
    readback.seek(SeekFrom::Start(16384)).unwrap();
    let mut contents = vec![0u8; 3 * 4096];
    readback.read_exact(&mut contents).unwrap();

    assert!(contents[..4096].iter().all(|&b| b == 0x41));
    assert!(contents[4096..8192].iter().all(|&b| b == 0x42));
    assert!(contents[8192..].iter().all(|&b| b == 0x43));

    handle.close(&mut lp);
    dir.close().unwrap();
}

#[test]
fn negative_offset_is_clamped_to_start() {
    let (dir, path) = create_filled_tempfile(FILE_SIZE);
    let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();

    let mut lp = EventLoop::new();
    let handle = fan_out_handle(&mut lp);

    let done = Rc::new(Cell::new(false));
    let flag = done.clone();

    let req = FsRequest::write(
        &file,
        -3,
        vec![IoBuf::from(vec![0x58u8; 512])],
        move |_, req| {
            assert_eq!(512, req.result().unwrap());
            flag.set(true);
        },
    )
    .write_flags(WriteFlags::DSYNC);
    handle.submit(&mut lp, req).unwrap();

    drive_until(&mut lp, &done);

    let mut readback = std::fs::File::open(&path).unwrap();
    let mut head = vec![0u8; 512];
    readback.read_exact(&mut head).unwrap();
    assert!(head.iter().all(|&b| b == 0x58));

    handle.close(&mut lp);
    dir.close().unwrap();
}

#[test]
fn many_requests_in_flight() {
    const REQUESTS: u32 = 32;

    let (dir, path) = create_filled_tempfile(FILE_SIZE);
    let file = OpenOptions::new().read(true).open(&path).unwrap();

    let mut lp = EventLoop::new();
    let handle = fan_out_handle(&mut lp);

    let completed = Rc::new(Cell::new(0u32));
    let done = Rc::new(Cell::new(false));

    let mut rng = thread_rng();
    for _ in 0..REQUESTS {
        let page = rng.gen_range(0, FILE_SIZE / PAGE);
        let offset = (page * PAGE) as i64;

        let counter = completed.clone();
        let flag = done.clone();
        let req = FsRequest::read(&file, offset, vec![IoBuf::with_size(PAGE)], move |_, req| {
            assert_eq!(PAGE as u64, req.result().unwrap());
            assert_eq!(
                pattern(offset as u64, PAGE).as_slice(),
                req.bufs()[0].as_ref()
            );

            counter.set(counter.get() + 1);
            if counter.get() == REQUESTS {
                flag.set(true);
            }
        });
        handle.submit(&mut lp, req).unwrap();
    }

    drive_until(&mut lp, &done);
    assert_eq!(REQUESTS, completed.get());

    handle.close(&mut lp);
    dir.close().unwrap();
}

#[test]
fn submitting_after_close_reports_stopped() {
    let (dir, path) = create_filled_tempfile(PAGE);
    let file = OpenOptions::new().read(true).open(&path).unwrap();

    let mut lp = EventLoop::new();
    let handle = fan_out_handle(&mut lp);
    handle.close(&mut lp);

    let req = FsRequest::read(&file, 0, vec![IoBuf::with_size(PAGE)], |_, _| {
        panic!("must not fire")
    });
    assert_matches!(handle.submit(&mut lp, req), Err(SubmitError::Stopped));

    dir.close().unwrap();
}
