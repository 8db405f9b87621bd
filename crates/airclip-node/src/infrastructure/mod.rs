//! Infrastructure layer for the node.
//!
//! Contains OS-facing adapters: the UDP discovery socket, the TCP transfer
//! service, and file-system configuration storage.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `airclip_core`, but MUST NOT be imported by the `application` or domain
//! layers.

pub mod network;
pub mod storage;
