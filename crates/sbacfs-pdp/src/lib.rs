//! sbacfs reference policy decision point
//!
//! A small TCP service answering the remote authorization requests sbacfs
//! sends. Each request is a path and an operation; the answer echoes both and
//! appends the decision.
//!
//! # Example Flow
//!
//! ```text
//! sbacfs                                    PDP
//! │                                           │
//! │  /foo/a,open                              │
//! │ ─────────────────────────────────────────>│
//! │                                           │
//! │                        /foo/a,open,True   │
//! │<───────────────────────────────────────── │
//! │                                           │
//! │  /etc/shadow,read                         │
//! │ ─────────────────────────────────────────>│
//! │                                           │
//! │                   /etc/shadow,read,False  │
//! │<───────────────────────────────────────── │
//! ```
//!
//! A connection serves requests until the peer closes it. Access is granted
//! when the peer address, the path and the operation all appear in the
//! [`Allowlist`].

mod allowlist;
mod server;

pub use allowlist::{Allowlist, AllowlistError};
pub use server::{PdpServer, answer};
