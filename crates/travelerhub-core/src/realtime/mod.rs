//! Realtime channel management.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  ChannelSlot: at most one open channel per owner                │
//! │  └── Subscription: scoped handle over one transport channel     │
//! │      ├── dispatch task: feed receiver → handler                 │
//! │      └── teardown (close or drop): abort task, remove channel   │
//! │                                                                 │
//! │  PresenceTracker: online peer ids from a presence channel       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod channel;
mod presence;

pub use channel::{ChannelSlot, Subscription};
pub use presence::PresenceTracker;
