//! Media transport for the softphone engine
//!
//! A [`MediaStream`] is one negotiated RTP leg: it binds a local UDP port,
//! paces outbound audio frames, buffers inbound audio by RTP timestamp,
//! detects RFC 4733 key presses and keeps NAT bindings alive while held.
//! The [`mixer`] combines audio read from several legs of one call.
//!
//! ```rust,no_run
//! # use softphone_media_core::{MediaStream, MediaStreamConfig};
//! # use softphone_rtp_core::PayloadAssociation;
//! # async fn example() -> softphone_media_core::MediaResult<()> {
//! let config = MediaStreamConfig::new(
//!     "0.0.0.0:10000".parse().unwrap(),
//!     "192.0.2.10:4000".parse().unwrap(),
//!     PayloadAssociation::default_offer(),
//! );
//! let stream = MediaStream::new(config, None)?;
//! stream.start().await?;
//! stream.write(&[0xFF; 160]);
//! let heard = stream.read(160, false).await;
//! stream.stop();
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod mixer;
pub mod stream;

pub use buffer::{PacketBuffer, WriteOutcome};
pub use config::{MediaSettings, MediaStreamConfig, TransmitMode};
pub use error::{MediaError, MediaResult};
pub use mixer::mix_frames;
pub use stream::{DtmfCallback, MediaStream, StreamState, StreamStats};
