pub mod charges;
pub mod worker;
pub mod workflows;
