// src/services/mod.rs

pub mod attendance;
pub mod backfill;
pub mod batch;
pub mod geo;
pub mod ledger;
pub mod maps;
pub mod pipeline;
pub mod reimbursement;
