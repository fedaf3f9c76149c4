pub mod catalog;
pub mod controller;
pub mod intent;
pub mod ports;
pub mod screens;
pub mod session;
