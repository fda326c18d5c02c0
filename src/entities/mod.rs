pub mod poll;
pub mod poll_candidate;
pub mod vote;
