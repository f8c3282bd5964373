// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use criterion::Criterion;
use epoch_stm::{Address, Region, Result, Strategy, Transaction};
use rand::Rng;
use std::sync::Arc;
use threadpool::ThreadPool;

const ACCOUNTS: usize = 64;

fn transfer(tx: &mut Transaction<'_>, from: Address, to: Address, amount: u64) -> Result<()> {
    let mut buffer = [0u8; 8];

    tx.read(from, &mut buffer)?;
    let balance = u64::from_le_bytes(buffer);
    if balance < amount {
        return Ok(());
    }
    tx.write(&(balance - amount).to_le_bytes(), from)?;

    tx.read(to, &mut buffer)?;
    tx.write(&(u64::from_le_bytes(buffer) + amount).to_le_bytes(), to)
}

/// One read-write transaction touching a single word
pub fn bnc_single_word(c: &mut Criterion) {
    c.bench_function("bench_single_word", |b| {
        let region = Region::new(8, 8).expect("Failed to create region");

        b.iter(|| {
            region
                .execute(false, Strategy::Retry, |tx| tx.write(&234u64.to_le_bytes(), region.start()))
                .expect("Failed to run transaction");
        })
    });
}

/// One transaction writing 4096 words, all published by the same transition
pub fn bnc_publish_wide(c: &mut Criterion) {
    c.bench_function("bench_publish_wide", |b| {
        let region = Region::new(4096 * 8, 8).expect("Failed to create region");
        let payload = vec![0xa5u8; 4096 * 8];

        b.iter(|| {
            region
                .execute(false, Strategy::Retry, |tx| tx.write(&payload, region.start()))
                .expect("Failed to run transaction");
        })
    });
}

/// Random transfers between accounts, run by a pool of worker threads
pub fn bnc_concurrent_transfers(c: &mut Criterion) {
    c.bench_function("bench_concurrent_transfers", |b| {
        let region = Arc::new(Region::new(ACCOUNTS * 8, 8).expect("Failed to create region"));
        let pool = ThreadPool::new(8);

        region
            .execute(false, Strategy::Retry, |tx| tx.write(&vec![100u8; ACCOUNTS * 8], region.start()))
            .expect("Failed to initialize accounts");

        b.iter(|| {
            for _ in 0..64 {
                let region = region.clone();
                pool.execute(move || {
                    let mut rng = rand::thread_rng();
                    let from = rng.gen_range(0..ACCOUNTS);
                    let to = rng.gen_range(0..ACCOUNTS);
                    let amount = rng.gen_range(0..50);

                    region
                        .execute(false, Strategy::Retry, |tx| {
                            transfer(
                                tx,
                                region.start().offset(from * 8),
                                region.start().offset(to * 8),
                                amount,
                            )
                        })
                        .expect("Failed to transfer");
                });
            }
            pool.join();
        })
    });
}
