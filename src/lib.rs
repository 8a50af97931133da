/// DebateRoom Core - Real-time connection and message synchronization
///
/// The live-room engine behind the debate platform: a per-conversation
/// connection state machine with bounded reconnection, an optimistic
/// message pipeline with client-id reconciliation, presence and typing
/// tracking with heartbeats, cursor-based history paging, and a
/// notification projection for the UI.

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod history;
pub mod model;
pub mod notify;
pub mod presence;
pub mod room;
pub mod sync;
pub mod transport;

pub use config::SyncConfig;
pub use connection::ConnectionManager;
pub use error::{Result, SyncError};
pub use events::{EventBus, RoomEvent};
pub use history::{HistoryPager, JumpResult, SearchResults};
pub use model::{
    ConnectionState, DebatePhase, Identity, Message, MessageKind, MessageStatus,
    PaginationCursor, ParticipantPresence, Reaction,
};
pub use notify::{Notification, NotificationDispatcher, Severity};
pub use presence::PresenceTracker;
pub use room::RoomSession;
pub use sync::MessageSynchronizer;
pub use transport::{
    ClientCommand, HistoryBackend, HistoryPage, InMemoryServer, ServerEvent, Transport,
    TransportChannel, WireMessage,
};
