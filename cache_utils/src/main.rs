// Prints what the measurement tool will assume about the cache hierarchy,
// then runs a local hit/miss calibration on a private line.

use cache_utils::cache_info::{get_cache_info, CacheGeometry};
use cache_utils::calibration::{HistParams, Histogram, Threshold};
use cache_utils::mmap::MMappedMemory;
use cache_utils::stats::SampleSeries;
use cache_utils::timing::{MonotonicClock, Timer};
use cache_utils::{evict, maccess, touch_lines};

const NUM_ITERATION: usize = 1 << 8;

pub fn main() {
    println!("{:#?}", get_cache_info());
    let geometry = CacheGeometry::detect();
    println!("Geometry: {}", geometry);

    let clock = match MonotonicClock::new() {
        Ok(clock) => clock,
        Err(e) => {
            eprintln!("No monotonic clock: {}", e);
            std::process::exit(1);
        }
    };
    let timer = Timer::new(clock);

    let mut line = MMappedMemory::new(geometry.line_size, |i| i as u8);
    let mut scratch = MMappedMemory::new(geometry.cache_size * 10, |i| i as u8);
    let p = line.as_mut_ptr();

    eprint!("Calibrating...");
    let mut hits = SampleSeries::with_capacity(NUM_ITERATION);
    let mut misses = SampleSeries::with_capacity(NUM_ITERATION);
    for _ in 0..NUM_ITERATION {
        unsafe { touch_lines(p, geometry.line_size, geometry.line_size) };
        hits.push(timer.time_read(|| unsafe { maccess(p) }));
        evict(&mut scratch, geometry.line_size);
        misses.push(timer.time_read(|| unsafe { maccess(p) }));
    }
    eprintln!(" done");

    let params = HistParams::default();
    let hit_hist = Histogram::from_samples(params, &hits);
    let miss_hist = Histogram::from_samples(params, &misses);

    println!("RESULT:time,hit,miss");
    for (i, (h, m)) in hit_hist
        .buckets()
        .iter()
        .zip(miss_hist.buckets())
        .enumerate()
    {
        if *h != 0 || *m != 0 {
            println!("RESULT:{},{},{}", hit_hist.from_bucket(i), h, m);
        }
    }
    if let (Some(hit), Some(miss)) = (hits.summary(), misses.summary()) {
        println!("hit:  {}", hit);
        println!("miss: {}", miss);
    }
    match Threshold::from_histograms(&hit_hist, &miss_hist) {
        Some(threshold) => println!("Threshold: {}", threshold),
        None => println!("No threshold: hit and miss latencies overlap"),
    }
}
