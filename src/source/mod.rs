// Artifact sources: where bytes come from, and how candidate mirrors are raced.

pub mod http_source;
pub mod race;
pub mod traits;
