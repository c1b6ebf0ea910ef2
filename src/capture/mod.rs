pub mod grabber;
pub mod worker;
