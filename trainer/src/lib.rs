pub mod config;
pub mod debug_server;
pub mod error;
pub mod ftms_service;
pub mod gears;
pub mod hardware;
pub mod load;
pub mod motor;
pub mod protocol;
pub mod pulse;
pub mod session;
pub mod speed;
pub mod trainer;
