//! Vhost-user slave: wire format, per-queue state, and the device that ties
//! protocol handling to the virtio block model.

pub mod device;
pub mod message;
pub mod vring;
