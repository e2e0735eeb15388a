pub mod downstreaminterface;
pub mod memory;
pub mod publisher;
pub mod transport;

pub mod models;

pub use downstreaminterface::{MqttTransport, MqttTransportConfig};
pub use memory::{BrokerEvent, InMemoryBroker};
pub use models::sensor::SensorMessage;
pub use models::status::{StatusMessage, StatusType};
pub use models::topics::{validate_vehicle_id, Topics, VehicleIdError, DEFAULT_STATUS_TOPIC};
pub use models::types::{BrokerAddress, ConnectOptions, LastWill, MqttPublish, Qos};
pub use publisher::{PublisherConfig, PublisherError, PublisherState, TelemetryPublisher};
pub use transport::Transport;
