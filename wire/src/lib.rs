pub mod config;
pub mod devices;
pub mod kocom;
pub mod lgac;
