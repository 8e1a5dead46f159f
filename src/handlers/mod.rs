// src/handlers/mod.rs

pub mod attendance;
pub mod events;
pub mod general;
pub mod reimbursement;
