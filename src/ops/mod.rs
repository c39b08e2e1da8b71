//! Operational concerns: meters and the `/varz` runtime snapshot.

pub mod meters;
