//! Role-specific device facades.
//!
//! A facade receives the device connection callbacks and decides what gets
//! published for the device on this node. The owner publishes the real
//! services and the operational status record; a follower publishes proxies
//! to the owner and never writes status.

mod follower;
mod owner;

pub use follower::FollowerFacade;
pub use owner::OwnerFacade;

use async_trait::async_trait;

use crate::error::TopologyResult;
use crate::payload::{DeviceNotification, DeviceSession};
use crate::services::DeviceServices;

#[async_trait]
pub trait DeviceFacade: Send + Sync {
    async fn on_device_connected(&self, session: DeviceSession, services: DeviceServices);

    async fn on_device_disconnected(&self);

    async fn on_device_failed(&self, cause: String);

    fn on_notification(&self, notification: DeviceNotification);

    /// Withdraw everything this facade published.
    async fn close(&self) -> TopologyResult<()>;
}
