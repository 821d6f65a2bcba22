use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RingError {
    #[error("head and tail out of sync on an empty ring")]
    HeadAndTailOutOfSync,
    #[error("used byte count underflowed")]
    UsedLessThanZero,
    #[error("tail advanced past capacity")]
    TailExceededCapacity,
    #[error("appending {requested} bytes would exceed capacity ({used}/{capacity} in use)")]
    AttemptToExceedCapacity { used: usize, requested: usize, capacity: usize },
    #[error("used byte count grew past capacity")]
    BufferSizeHasBeenExceeded,
    #[error("head advanced past capacity")]
    HeadHasExceededCapacity,
    #[error("modifying {length} bytes at offset {offset} lands outside the {used} bytes in use")]
    ModifyOutOfBounds { offset: usize, length: usize, used: usize },
}
