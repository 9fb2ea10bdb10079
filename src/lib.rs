// #![allow(unused)]
#![deny(unsafe_op_in_unsafe_fn)]
#![feature(allocator_api)]

// single-threaded: every operation is a finite run of pointer rewrites and
// comparisons, callers serialize access themselves
pub mod rbtree;

pub use rbtree::{Key, NodeRef, RBTree};
