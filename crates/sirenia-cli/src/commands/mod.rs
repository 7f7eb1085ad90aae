pub mod peer;
pub mod sim;
pub mod tunables;
