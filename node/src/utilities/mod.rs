pub(crate) mod encoding;
pub(crate) mod hash;
pub mod time;

pub use hash::Hash;
pub use time::Time;
