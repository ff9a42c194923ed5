//! # dlm-core
//!
//! Shared async plumbing for `dlm_controld` and `dlm_tool`: control
//! socket setup and length-prefixed bincode framing of administrative
//! traffic.

pub mod frame;
pub mod net;
