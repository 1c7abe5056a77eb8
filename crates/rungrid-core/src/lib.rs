pub mod config;
pub mod duration;
pub mod hash;
pub mod labels;

pub use config::RungridConfig;
pub use duration::parse_duration;
pub use hash::{content_hash, map_hash};
pub use labels::{SELF_HOSTED, labels_match};
