//! Admission control primitives: per-dimension scoreboards that cap how much
//! work may be in flight against one source or host at a time.

pub mod dimension;
pub mod scoreboard;
