//! Protocol implementations.
//!
//! - `echo`: length-prefixed frames echoed back to the sender
//!
//! Other services reuse the echo framing and swap in their own
//! [`echo::Service`].

pub mod echo;
