//! Reliability and session-control layer for a TLS-carrying control channel
//!  over an unreliable transport.
//!
//! The control channel carries handshake and key-negotiation messages that a
//!  TLS stack expects to see as a lossless, ordered stream. The underlying
//!  transport is typically UDP, which reorders, duplicates and drops
//!  datagrams - or TCP, which delivers a byte stream without datagram
//!  boundaries. This crate provides the machinery in between:
//!
//! * a sliding-window message store shared by the send side (retaining
//!   unacknowledged messages for retransmission) and the receive side
//!   (reordering messages before delivery)
//! * ACK aggregation with a re-ACK cache so that lost ACK packets do not
//!   cause unbounded retransmission
//! * random session identities with weak (64-bit prefix) and strong (full)
//!   equality for demultiplexing packets to sessions
//! * length-prefix reframing for running the protocol over a byte stream
//!
//! ## Design constraints
//!
//! * The core is single-threaded per session and never blocks. All waiting
//!   is expressed as a `Duration` handed back to the caller's event loop
//!   (see [`reliable_send::ReliableSend::until_retransmit`]).
//! * Retransmission policy (timeouts, backoff) is caller-driven; the send
//!   window only stores and compares deadlines.
//! * Protocol violations (malformed ACK lists, out-of-window references,
//!   bad stream frame sizes) are fatal to the session and surface as errors
//!   to the session driver. Flow control and stale data are not errors.
//!
//! ## Wire formats
//!
//! All integers are network byte order (BE).
//!
//! ACK list (standalone ACK packet payload, or prefix on control packets):
//! ```ascii
//! 0: number of acknowledged message ids (u8)
//! 1: (repeated) acknowledged message id (u32 BE)
//! ```
//!
//! Message id: u32 BE wherever it appears on the wire. Ids are assigned
//!  strictly increasing per direction and wrap modulo 2^32; the window span
//!  is far below 2^31, so wrap-around never aliases live ids.
//!
//! Stream framing (byte-stream transports only):
//! ```ascii
//! 0: payload length (u16 BE), excluding the 2-byte prefix itself
//! 2: payload
//! ```
//! A declared length of 0 or above the configured maximum payload is a fatal
//!  protocol error - a byte stream has no datagram boundaries to resync on.
//!
//! Session id: raw fixed-size byte string (8 or 16 bytes) on the wire;
//!  URL-safe base64 when rendered as text.

pub mod ack;
pub mod channel;
pub mod config;
pub mod driver;
pub mod message_id;
pub mod packet;
pub mod reliable_receive;
pub mod reliable_send;
pub mod safe_converter;
pub mod sequence_window;
pub mod session;
pub mod session_id;
pub mod stream_frame;
