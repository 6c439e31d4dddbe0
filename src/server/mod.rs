// Interception proxy: a standalone HTTP actor applying the artifact cache policy
// at the transport boundary.

pub mod generation;
pub mod handler;
