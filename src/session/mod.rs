//! Per-flow proxy sessions
//!
//! A session bridges one tunnel-side flow to one outbound socket. TCP
//! sessions hand their connected stream to the embedded stack task, which
//! owns the tunnel-side state machine; UDP sessions are self-contained
//! tasks pairing datagrams with a sliding idle timer.

pub mod tcp;
pub mod udp;
