//! The soundcard device: configuration, lifecycle and the render producer
//! around a backend adapter.

mod config;
mod error;
mod latency;
mod renderer;
mod soundcard;

pub use config::{SoundcardConfig, DEFAULT_BPM, DEFAULT_DELAY_FACTOR, DEFAULT_RING_SLOTS};
pub use error::{ConfigError, Result, SoundcardError};
pub use latency::LatencyMetrics;
pub use renderer::{PeriodBuffer, Renderer, SilentRenderer};
pub use soundcard::{DeviceState, Soundcard};

pub use soundcard_io as io;
pub use soundcard_rt as rt;
