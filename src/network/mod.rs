//! Connection-level plumbing shared by the server and client engines:
//! socket reading, buffer management, and the decode loop that turns raw
//! bytes into application messages.

pub use connection::Connection;
mod connection;
