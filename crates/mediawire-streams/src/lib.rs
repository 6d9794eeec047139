//! mediawire-streams is the real-time media transport: fragmenting frames
//! for the lossy datagram path, reassembling them on the far side, and
//! scheduling playout against a drifting peer clock.

pub mod bandwidth;
pub mod call;
pub mod driver;
pub mod frame;
pub mod playout_buffer;
pub mod reassembler;
pub mod ring_buffer;
pub mod scheduler;
pub mod session;
pub mod stream;
pub mod transport;

pub use bandwidth::{LossCounter, LossSnapshot};
pub use call::{Call, CallRegistry, CallStats, Collaborators, ReceiveError, RemoteHints};
pub use driver::{receive_loop, spawn_playout, Inbound, PlayoutDriver};
pub use frame::{MediaFrame, PeerId};
pub use playout_buffer::{PlayoutBuffer, PlayoutEntry};
pub use reassembler::{DropReason, FragmentOutcome, FrameSink, Reassembler};
pub use ring_buffer::RingBuffer;
pub use scheduler::{ClockEstimate, ClockOffsetEstimator, ClockSample, DriftCorrector};
pub use session::{RtpSession, SendError, SendStats};
pub use stream::{AudioStream, StreamStats, VideoStream};
pub use transport::{BandwidthFeedback, ControlChannel, FrameDecoder, LossyTransport, TransportError};
