pub mod monitoring;
pub mod recommendation;
pub mod training;
