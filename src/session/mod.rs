//! 会话层：会话池、准入控制与空闲清扫

pub mod manager;

pub use manager::{ChatResponse, Session, SessionLease, SessionManager};
