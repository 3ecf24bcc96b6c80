//! Core of an RTP-MIDI (AppleMIDI) endpoint: carries MIDI messages between a local
//! MIDI sequencer and remote RTP-MIDI peers over UDP.
//!
//! The crate is organized bottom-up, mirroring the protocol's own layering:
//! - [`codec`] parses and emits AppleMIDI commands and RTP-MIDI packets.
//! - [`translator`] converts between MIDI bytes and sequencer event records.
//! - [`peer`] is the per-peer session state machine (invite/accept/sync/teardown).
//! - [`registry`] is the dual-keyed lookup from initiator token / remote SSRC to peer.
//! - [`dispatcher`] is the single-threaded readiness + timer event loop.
//! - [`endpoint`] owns the two UDP sockets and routes datagrams to peers.
//! - [`discovery`] turns mDNS advertisements into dispatcher tasks.
//!
//! ## Unsupported features
//! - **Recovery journal.** Lost packets are not retransmitted by content.
//! - **TCP transport, SysEx segmentation beyond one packet, authentication.**
pub mod codec;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod peer;
pub mod registry;
pub mod sequencer;
pub mod ssrc;
pub mod translator;

pub use error::RtpMidiError;
