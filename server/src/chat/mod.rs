pub mod broadcast;
pub mod connection;
pub mod messages;
pub mod presence;
pub mod session;
pub mod subscriber;
