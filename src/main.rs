//! Benchmark harness for the persistent B+-tree.
//!
//! Loads half the key set single-threaded as warm-up, then runs a
//! concurrent search phase over the warm half and a concurrent insert phase
//! over the cold half, reporting wall-clock time and throughput for each.
//! The workload is written against [`OrderedIndex`] only, so any index
//! implementing the contract can sit under it.
//!
//! ```bash
//! cargo run --release -- -n 1000000 -t 8 -p /mnt/pmem/bench.pool
//! RUST_LOG=pmbtree=debug cargo run --release --features tracing -- -n 100000 -t 4 -p /tmp/b.pool
//! ```
//!
//! Flags: `-n <num_keys>` `-t <threads>` `-i <input_path>` `-p <pool_path>`.
//! Without `-i`, keys come from a fixed-seed xorshift generator so runs are
//! reproducible. Exit code 0 on success.

#![allow(clippy::cast_precision_loss)]

use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use pmbtree::{BTree, OrderedIndex, PmPool, PoolConfig, TreeConfig};

struct Args {
    num_keys: usize,
    threads: usize,
    input_path: Option<PathBuf>,
    pool_path: PathBuf,
}

fn usage(program: &str) -> ! {
    eprintln!("usage: {program} -n <num_keys> [-t <threads>] [-i <input_path>] -p <pool_path>");
    std::process::exit(2);
}

fn parse_args() -> Args {
    let argv: Vec<String> = std::env::args().collect();
    let program = argv.first().map_or("pmbtree", String::as_str).to_string();

    let mut args = Args {
        num_keys: 0,
        threads: 1,
        input_path: None,
        pool_path: PathBuf::new(),
    };

    let mut it = argv.iter().skip(1);
    while let Some(flag) = it.next() {
        let value = it.next().unwrap_or_else(|| usage(&program));
        match flag.as_str() {
            "-n" => args.num_keys = value.parse().unwrap_or_else(|_| usage(&program)),
            "-t" => args.threads = value.parse().unwrap_or_else(|_| usage(&program)),
            "-i" => args.input_path = Some(PathBuf::from(value)),
            "-p" => args.pool_path = PathBuf::from(value),
            _ => usage(&program),
        }
    }

    if args.num_keys == 0 || args.threads == 0 || args.pool_path.as_os_str().is_empty() {
        usage(&program);
    }
    args
}

/// Fixed-seed 64-bit xorshift*, so every run sees the same key stream.
struct KeyGen(u64);

impl KeyGen {
    fn next(&mut self) -> i64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        (self.0.wrapping_mul(0x2545_f491_4f6c_dd1d)) as i64
    }
}

fn load_keys(args: &Args) -> std::io::Result<Vec<i64>> {
    let mut keys = Vec::with_capacity(args.num_keys);

    if let Some(path) = &args.input_path {
        let file = std::fs::File::open(path)?;
        for line in std::io::BufReader::new(file).lines() {
            if keys.len() == args.num_keys {
                break;
            }
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match trimmed.parse::<i64>() {
                // Key 0 would map to the null value handle.
                Ok(0) => continue,
                Ok(key) => keys.push(key),
                Err(err) => {
                    eprintln!("bad key {trimmed:?} in input file: {err}");
                    std::process::exit(2);
                }
            }
        }
    }

    let mut keygen = KeyGen(0x1234_5678_9abc_def0);
    while keys.len() < args.num_keys {
        let key = keygen.next();
        if key != 0 {
            keys.push(key);
        }
    }

    Ok(keys)
}

fn value_of(key: i64) -> u64 {
    key as u64
}

fn run_phase<F>(label: &str, threads: usize, ops: usize, body: F)
where
    F: Fn(usize) + Sync,
{
    let start = Instant::now();

    std::thread::scope(|scope| {
        for tid in 0..threads {
            let body = &body;
            scope.spawn(move || body(tid));
        }
    });

    let elapsed = start.elapsed();
    println!(
        "{label} with {threads} threads (usec): {}",
        elapsed.as_micros()
    );
    println!(
        "Throughput = {:.3} Mops/s",
        ops as f64 / elapsed.as_secs_f64() / 1_000_000.0
    );
}

/// The benchmark proper, written against the index contract only.
fn run_benchmark<T: OrderedIndex + Sync>(index: &T, keys: &[i64], threads: usize) -> bool {
    let num_keys = keys.len();
    let half = num_keys / 2;
    let per_thread = half.max(1) / threads;

    // Warm-up: load the first half single-threaded.
    let start = Instant::now();
    for &key in &keys[..half] {
        if !index.insert(key, value_of(key)) {
            eprintln!("warm-up insert failed for key {key} (pool full?)");
            return false;
        }
    }
    println!("Warm-up: {half} keys in {:?}", start.elapsed());

    // Concurrent search over the warm half.
    run_phase("Concurrent searching", threads, half, |tid| {
        let from = per_thread * tid;
        let to = if tid == threads - 1 {
            half
        } else {
            from + per_thread
        };
        for &key in &keys[from..to] {
            std::hint::black_box(index.search(key));
        }
    });

    // Concurrent insert of the cold half.
    run_phase("Concurrent inserting", threads, half, |tid| {
        let from = half + per_thread * tid;
        let to = if tid == threads - 1 {
            num_keys
        } else {
            from + per_thread
        };
        for &key in &keys[from..to] {
            index.insert(key, value_of(key));
        }
    });

    true
}

fn main() -> ExitCode {
    pmbtree::init_tracing();

    let args = parse_args();

    let keys = match load_keys(&args) {
        Ok(keys) => keys,
        Err(err) => {
            eprintln!("failed to read keys: {err}");
            return ExitCode::FAILURE;
        }
    };

    let pool = match PmPool::open(&PoolConfig::new(&args.pool_path)) {
        Ok(pool) => Arc::new(pool),
        Err(err) => {
            eprintln!("failed to open pool {}: {err}", args.pool_path.display());
            return ExitCode::FAILURE;
        }
    };

    let tree: BTree = match BTree::open(pool, TreeConfig::default()) {
        Ok(tree) => tree,
        Err(err) => {
            eprintln!("failed to open tree: {err}");
            return ExitCode::FAILURE;
        }
    };

    if !run_benchmark(&tree, &keys, args.threads) {
        return ExitCode::FAILURE;
    }

    let stats = tree.stats();
    println!(
        "height={} nodes={} keys={} (leaf keys={})",
        stats.height, stats.nodes, stats.keys, stats.leaf_keys
    );

    ExitCode::SUCCESS
}
