// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Epoch Batched Software Transactional Memory
//!
//! This crate implements a dual-version software transactional memory. A [`Region`] is a
//! shared memory of fixed size words on which threads run [`Transaction`]s. Every word keeps
//! a committed and a speculative copy. Transactions are batched into epochs: within an
//! epoch the first writer of a word owns it exclusively and writes its speculative copy,
//! and when the last member of the epoch leaves, all speculative copies written by
//! committed transactions become visible at once.
//!
//! Read-only transactions read the committed copies only. They never conflict and always
//! commit.
//!
//! ```
//! use epoch_stm::{Region, TxError};
//!
//! let region = Region::new(8, 8)?;
//!
//! let mut tx = region.begin(false)?;
//! tx.write(&7u64.to_le_bytes(), region.start())?;
//! assert!(tx.end());
//!
//! let mut tx = region.begin(true)?;
//! let mut value = [0u8; 8];
//! tx.read(region.start(), &mut value)?;
//! assert!(tx.end());
//! assert_eq!(u64::from_le_bytes(value), 7);
//! # Ok::<(), TxError>(())
//! ```

mod address;
mod batcher;
mod breaker;
mod config;
mod error;
mod region;
mod segment;
mod strategy;
mod transaction;
mod word;

pub use address::Address;
pub use breaker::BusyBreaker;
pub use config::{Admission, RegionConfig};
pub use error::{Result, TxError};
pub use region::Region;
pub use strategy::Strategy;
pub use transaction::{Transaction, TxId, TxState};
