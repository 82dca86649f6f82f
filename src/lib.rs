//! Treelet-partitioned BVH core for distributed, out-of-core ray tracing.
//!
//! The offline half carves a flat BVH over a scene's primitives into
//! fixed-budget *treelets* and serializes them as independently loadable
//! files. The online half loads treelets on demand and answers the standard
//! ray queries, suspending rays at treelet boundaries so a scheduler can
//! move them between workers.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

pub mod accelerators;
pub mod core;
pub mod shapes;
