//! Feature modules (analysis pipeline stages)

pub mod abstraction;
pub mod callbacks;
pub mod driver;
pub mod ondemand;
pub mod orchestration;
pub mod prop;
pub mod prover;
pub mod rearrange;
pub mod reporting;
pub mod summaries;
pub mod symexec;
pub mod tabulation;
