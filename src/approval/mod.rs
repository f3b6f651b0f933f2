//! Human-in-the-loop approval gate.

mod gate;

pub use gate::{ApprovalAction, ApprovalGate, ApprovalRequest, ApprovalResponse};
