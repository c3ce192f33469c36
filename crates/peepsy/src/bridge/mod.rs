//! Channel plumbing: envelope wire model and framed codec.

pub mod codec;
pub mod protocol;
