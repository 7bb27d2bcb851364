// SPDX-License-Identifier: Apache-2.0

//! Small inline collections with no allocator involvement, used on paths where
//! the SCX protocol cannot tolerate the latency of a heap call.

mod uarray;

pub use uarray::UArray;
