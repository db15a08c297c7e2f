//! Real-time primitives of the soundcard scheduler.

pub mod bridge;
pub mod format;
pub mod health;
pub mod queue;
pub mod ring;
pub mod timing;
pub mod transport;

pub use bridge::{BridgeMode, BridgeState, CallbackBridge, Wake};
pub use format::{Presets, PresetsError, SampleFormat};
pub use health::{Health, HealthReport};
pub use queue::{EventQueue, QueueError};
pub use ring::{
    ReadSlot, RingBuffer, RingError, RingLayout, SubBlockGuard, WriteSlot, DEFAULT_SUB_BLOCK_COUNT,
};
pub use timing::{Tick, TimingError, TimingTable, FINE_RESOLUTION, PERIOD_COUNT};
pub use transport::{LoopRegion, PositionEvent, TransportCommand, TransportError, TransportState};
