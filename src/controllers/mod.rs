pub mod addon;
pub mod controller;
pub mod hub;
