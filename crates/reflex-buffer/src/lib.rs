mod error;
mod ring;

pub use error::RingError;
pub use ring::{RingBuffer, RingGuard};
