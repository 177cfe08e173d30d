pub mod alerts;
pub mod center;
pub mod error;
pub mod queue;
pub mod state;
pub mod tabs;
pub mod transport;

pub use alerts::{AlertSink, PlatformAlert, RecordingAlertSink, TracingAlertSink};
pub use center::{NotificationCenter, SubmitOutcome};
pub use error::{ClientError, QueueError, TransportError};
pub use queue::OfflineQueue;
pub use state::{reconnect_delay, ConnectionStatus, SubscriptionState};
pub use tabs::{TabBus, TabPublisher, TabSubscriber};
pub use transport::{EventStream, HttpTransport, NotificationApi};
