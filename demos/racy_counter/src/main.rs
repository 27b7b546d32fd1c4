//! 同期なしで共有カウンタを更新するデモプログラム
//!
//! `bump` の書き込みと `observe` の読み込みがデータ競合になります。

use std::thread;

static mut COUNTER: u64 = 0;

const WORKERS: usize = 4;
const ITERATIONS: u64 = 1000;

#[inline(never)]
fn bump() {
    unsafe {
        COUNTER += 1;
    }
}

#[inline(never)]
fn observe() -> u64 {
    let seen = unsafe { COUNTER };
    seen
}

fn main() {
    let handles: Vec<_> = (0..WORKERS)
        .map(|worker| {
            thread::spawn(move || {
                let mut last = 0;
                for _ in 0..ITERATIONS {
                    if worker % 2 == 0 {
                        bump();
                    } else {
                        last = observe();
                    }
                }
                last
            })
        })
        .collect();

    for handle in handles {
        let _ = handle.join();
    }

    let total = observe();
    println!("counter = {} (expected {})", total, ITERATIONS * (WORKERS as u64 / 2));
}
