//! Decode/resize/encode pipeline (spec.md §4.5): a `TransformPrimitive`
//! trait over the full `TransformOptions` shape.

pub mod core;

pub use core::{LocalImageTransform, TransformOutput, TransformPrimitive};
