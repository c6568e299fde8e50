//! # micbridge-sdp
//!
//! Parser for the session descriptions returned by a MicBridge device when a listener
//! asks it to describe its stream.
//!
//! The parser keeps only what a listener needs to negotiate and play the stream:
//! the media substreams with their codec and control URL, and the play window
//! (relative `npt` ranges or absolute `clock` ranges) used to compute the expected
//! stream duration.
//!
//! ```rust
//! use micbridge_sdp::SessionDescription;
//!
//! let sdp = "v=0\r\n\
//!            s=MicBridge\r\n\
//!            a=range:npt=0-12.5\r\n\
//!            m=audio 0 RTP/AVP 97\r\n\
//!            a=rtpmap:97 L16/44100/2\r\n\
//!            a=control:trackID=1\r\n";
//!
//! let description = SessionDescription::parse(sdp).unwrap();
//! assert_eq!(description.media().len(), 1);
//! assert_eq!(description.media()[0].codec_name(), "L16");
//! assert_eq!(description.expected_duration(), 12.5);
//! ```

pub mod error;
pub mod range;
pub mod session;

pub use error::{SdpError, SdpResult};
pub use range::PlayRange;
pub use session::{MediaDescription, RtpMap, SessionDescription};
