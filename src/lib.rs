// Licensed under the Apache-2.0 license

// No panic-prone patterns outside tests
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::indexing_slicing))]
#![cfg_attr(not(test), warn(clippy::expect_used))]
#![cfg_attr(not(test), no_std)]
pub mod common;
pub mod i3c;
pub mod tests;
