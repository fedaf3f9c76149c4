pub mod access;
pub mod commands;
pub mod delivery;
pub mod keyboards;
pub mod media;
