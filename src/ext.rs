//! Extension contracts for consuming broker-issued credentials downstream.

pub mod request_signer;

pub use request_signer::*;
