use std::cell::Cell;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;

use tempfile::{tempdir, TempDir};

use wheelio::{EventLoop, Timer};

pub const FILE_SIZE: usize = 512 * 1024;

/// Deterministic byte pattern of the test file contents at `offset`.
pub fn pattern(offset: u64, len: usize) -> Vec<u8> {
    (0..len).map(|i| (offset as usize + i) as u8).collect()
}

pub fn create_filled_tempfile(size: usize) -> (TempDir, PathBuf) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data");

    let mut file = File::create(&path).unwrap();
    file.write_all(&pattern(0, size)).unwrap();
    file.sync_all().unwrap();

    (dir, path)
}

/// Iterate the loop until `done` flips, with a watchdog so a missing
/// completion fails the test instead of hanging it.
pub fn drive_until(lp: &mut EventLoop, done: &Rc<Cell<bool>>) {
    let watchdog = Timer::new();
    watchdog.start(lp, |_, _| panic!("test timed out"), 10_000, 0);

    while !done.get() {
        lp.run_once().unwrap();
    }

    watchdog.stop(lp);
}
