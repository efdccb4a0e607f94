//! Acoustic / satellite-relay communications stack for underwater and
//! remotely-operated vehicles: a schema-driven bit-packing codec, a
//! priority- and age-weighted queueing layer, and modem drivers that move
//! the resulting frames over severely bandwidth-limited links.
//!
//! ## Design goals
//!
//! * Every payload bit is precious: links run at tens to thousands of bits
//!   per second, with per-byte airtime cost on satellite paths. Messages are
//!   therefore compiled against schemas that declare per-field ranges and
//!   precisions, and encoded into minimal-width bit runs rather than bytes.
//! * The medium decides when we may talk. An external medium-access
//!   controller grants transmission slots; the queue layer fills each
//!   granted slot with as many user frames as fit, chosen by a priority
//!   contest that weights configured importance against message age.
//! * Reliability is per-frame, not stream-based. A frame either gets an
//!   application-layer acknowledgment or it times out of its queue; there is
//!   no retransmission window, no ordering guarantee across queues, and no
//!   connection abstraction above a single call.
//! * One shore endpoint serves many field modems. The concrete driver here
//!   is the Iridium shore side: RUDICS calls (TCP sessions through the
//!   ground station) multiplexed over one listening socket, plus the
//!   store-and-forward SBD mailbox pair for vehicles that are not on a call.
//! * Single-threaded by contract. The host calls `do_work` on the driver
//!   and queue manager at 10 Hz or faster; socket I/O happens on background
//!   tasks whose events are drained inside `do_work`, so every upcall into
//!   application code runs on the host's thread in wire-arrival order.
//!
//! ## Layers
//!
//! ```ascii
//! application records
//!        |  push / on_receive
//! [queue::QueueManager]     priority contest, frame stitching, ACK fan-out
//!        |  data_request / receive
//! [driver::iridium::IridiumShoreDriver]   call state, pacing, SBD gateway
//!        |  lines / DirectIP messages
//! RUDICS TCP - SBD MO/MT sockets
//! ```
//!
//! The codec ([`codec::Codec`]) is shared: the queue layer encodes records
//! on push and decodes user frames on receive. Frames start with a fixed
//! seven-byte head carrying the legacy CCL id byte, the schema id, a
//! time-of-day stamp and the routing ids; a reserved CCL id marks frames of
//! this stack so legacy single-byte-identified messages can share the link.
//!
//! Component wiring is explicit: the driver takes a
//! [`driver::DriverEvents`] sink, the queue manager a
//! [`queue::QueueEvents`] sink, and [`bind`] provides the standard
//! driver-to-queue coupling. No global state exists apart from what the
//! host chooses to share; the codec registry travels by `Arc` handle.

pub mod bind;
pub mod codec;
pub mod driver;
pub mod error;
pub mod queue;
pub mod util;

/// Identifies one modem on the link. Id 0 is the broadcast address.
pub type ModemId = u32;

/// Destination meaning "every listener".
pub const BROADCAST_ID: ModemId = 0;
