//! Service Record Store — discoverable service advertisements
//!
//! A record is built once when a listening handle opens and mutated only by
//! the owning notifier. Updates are dirty-tracked so the backend is touched
//! only when something actually changed, and the channel assigned at open
//! time is enforced as immutable.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by record construction and validation
#[derive(Debug, Clone, Error)]
pub enum RecordError {
    #[error("Invalid service parameters: {0}")]
    InvalidParameters(String),
    #[error("Must not change the server channel number (assigned {assigned}, requested {requested})")]
    ImmutableChannelViolation { assigned: u16, requested: u16 },
}

/// Caller-supplied parameters for a new service advertisement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceParams {
    /// Service class UUIDs, most specific first
    pub uuids: Vec<Uuid>,
    /// Human-readable service name
    pub name: String,
    /// Major device service class bits to activate while listening
    pub device_service_classes: u32,
    /// Specific channel/PSM to request, or None for backend-assigned
    pub requested_channel: Option<u16>,
}

impl ServiceParams {
    /// Create parameters with a single service UUID
    pub fn new(uuid: Uuid, name: impl Into<String>) -> Self {
        Self {
            uuids: vec![uuid],
            name: name.into(),
            device_service_classes: 0,
            requested_channel: None,
        }
    }

    /// Set the device service class bits
    pub fn with_device_service_classes(mut self, classes: u32) -> Self {
        self.device_service_classes = classes;
        self
    }

    /// Request a specific channel/PSM instead of a backend-assigned one
    pub fn with_requested_channel(mut self, channel: u16) -> Self {
        self.requested_channel = Some(channel);
        self
    }

    /// Validate UUID list and name
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.uuids.is_empty() {
            return Err(RecordError::InvalidParameters(
                "At least one service UUID is required".to_string(),
            ));
        }
        if self.name.trim().is_empty() {
            return Err(RecordError::InvalidParameters(
                "Service name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Partial mutation applied through `update_service_record`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordUpdate {
    /// Replace the service name
    pub name: Option<String>,
    /// Replace the service UUID list
    pub uuids: Option<Vec<Uuid>>,
    /// Replace the device service class bits
    pub device_service_classes: Option<u32>,
    /// Channel claimed by the mutated record; must match the assigned one
    pub channel: Option<u16>,
}

impl RecordUpdate {
    /// Update that only renames the service
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

/// In-memory service advertisement with dirty tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Service class UUIDs
    pub uuids: Vec<Uuid>,
    /// Human-readable service name
    pub name: String,
    /// Channel/PSM assigned at open time; immutable thereafter
    channel: u16,
    /// Major device service class bits
    pub device_service_classes: u32,
    /// Whether an update is pending a push to the backend
    dirty: bool,
}

impl ServiceRecord {
    /// Deterministic construction from parameters and the assigned channel.
    /// Pure: no backend interaction, no side effects.
    pub fn build(params: &ServiceParams, channel: u16) -> Result<Self, RecordError> {
        params.validate()?;
        Ok(Self {
            uuids: params.uuids.clone(),
            name: params.name.clone(),
            channel,
            device_service_classes: params.device_service_classes,
            dirty: false,
        })
    }

    /// Channel/PSM assigned by the backend at open time
    pub fn channel(&self) -> u16 {
        self.channel
    }

    /// Whether an update is pending a push to the backend
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Flag the record as needing a push on the next accept cycle
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Clear the pending-push flag after a successful push
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Enforce the immutable-channel invariant before accepting an update.
    /// The channel is a backend-allocated resource; changing it after the
    /// record has been advertised would desynchronize remote discovery
    /// caches.
    pub fn validate_update(&self, update: &RecordUpdate) -> Result<(), RecordError> {
        if let Some(requested) = update.channel {
            if requested != self.channel {
                return Err(RecordError::ImmutableChannelViolation {
                    assigned: self.channel,
                    requested,
                });
            }
        }
        if let Some(uuids) = &update.uuids {
            if uuids.is_empty() {
                return Err(RecordError::InvalidParameters(
                    "At least one service UUID is required".to_string(),
                ));
            }
        }
        if let Some(name) = &update.name {
            if name.trim().is_empty() {
                return Err(RecordError::InvalidParameters(
                    "Service name cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Apply a validated update and mark the record dirty
    pub fn apply_update(&mut self, update: &RecordUpdate) -> Result<(), RecordError> {
        self.validate_update(update)?;
        if let Some(name) = &update.name {
            self.name = name.clone();
        }
        if let Some(uuids) = &update.uuids {
            self.uuids = uuids.clone();
        }
        if let Some(classes) = update.device_service_classes {
            self.device_service_classes = classes;
        }
        self.dirty = true;
        Ok(())
    }
}
