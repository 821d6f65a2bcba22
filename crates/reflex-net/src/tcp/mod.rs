mod listener;
mod talker;

pub use listener::{ListenState, ListenerEvents, TcpListener};
pub use talker::{ConnState, NullTalkerEvents, TalkerEvents, TcpTalker};
