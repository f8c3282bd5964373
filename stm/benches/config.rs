// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Transactional memory benches
//!
//! Test subjects:
//! - single threaded read / write transactions on one word
//! - epoch transitions publishing many words at once
//! - concurrent transfers between accounts
mod transfer;

use criterion::{criterion_group, criterion_main};
use transfer::*;

// all transactional memory benches
criterion_group!(benches, bnc_single_word, bnc_publish_wide, bnc_concurrent_transfers);

// main
criterion_main!(benches);
