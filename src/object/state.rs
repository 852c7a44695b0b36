//! Residency state of one logical object.
//!
//! [`GlobalObjectState`] records which device holds the latest contents and
//! one [`DeviceObjectState`] per device the object has been materialised
//! on. Only the owner can be exclusive, meaning its copy is newer than the
//! host copy.

use std::collections::BTreeMap;

use crate::backend::DeviceId;
use crate::memory::BufferHandle;
use crate::object::{ObjectId, ObjectShape};

/// Object state on a single device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceObjectState {
    buffer: Option<BufferHandle>,
    /// Device copy holds the latest contents
    valid: bool,
    /// No first-execution copy-in has happened yet
    first_execution: bool,
    /// Device copy is newer than the host copy
    dirty: bool,
    /// Persisted: the buffer survives end-of-plan deallocation
    locked: bool,
}

impl Default for DeviceObjectState {
    fn default() -> Self {
        Self {
            buffer: None,
            valid: false,
            first_execution: true,
            dirty: false,
            locked: false,
        }
    }
}

impl DeviceObjectState {
    pub fn buffer(&self) -> Option<&BufferHandle> {
        self.buffer.as_ref()
    }

    pub fn has_buffer(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn set_buffer(&mut self, buffer: BufferHandle) {
        self.buffer = Some(buffer);
    }

    /// Detach the buffer; the device copy is gone afterwards
    pub fn take_buffer(&mut self) -> Option<BufferHandle> {
        let buffer = self.buffer.take();
        self.invalidate();
        self.locked = false;
        buffer
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_first_execution(&self) -> bool {
        self.first_execution
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    pub fn mark_copied_in(&mut self) {
        self.valid = true;
        self.first_execution = false;
        self.dirty = false;
    }

    pub fn mark_written(&mut self) {
        self.valid = true;
        self.dirty = true;
    }

    pub fn mark_copied_out(&mut self) {
        self.dirty = false;
    }

    /// Device copy must be refreshed from the host before its next use
    pub fn invalidate(&mut self) {
        self.valid = false;
        self.first_execution = true;
        self.dirty = false;
    }
}

/// Object state across all devices
#[derive(Debug, Clone)]
pub struct GlobalObjectState {
    object: ObjectId,
    shape: ObjectShape,
    owner: Option<DeviceId>,
    exclusive: bool,
    first_copy_out_done: bool,
    devices: BTreeMap<DeviceId, DeviceObjectState>,
}

impl GlobalObjectState {
    pub fn new(object: ObjectId, shape: ObjectShape) -> Self {
        Self {
            object,
            shape,
            owner: None,
            exclusive: false,
            first_copy_out_done: false,
            devices: BTreeMap::new(),
        }
    }

    pub fn object(&self) -> ObjectId {
        self.object
    }

    pub fn shape(&self) -> &ObjectShape {
        &self.shape
    }

    pub fn owner(&self) -> Option<DeviceId> {
        self.owner
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn device_state(&self, device: DeviceId) -> Option<&DeviceObjectState> {
        self.devices.get(&device)
    }

    pub fn device_state_mut(&mut self, device: DeviceId) -> &mut DeviceObjectState {
        self.devices.entry(device).or_default()
    }

    pub fn devices(&self) -> impl Iterator<Item = (&DeviceId, &DeviceObjectState)> {
        self.devices.iter()
    }

    /// `device` wrote the object: it becomes the exclusive owner and every
    /// other device copy goes stale
    pub fn record_write(&mut self, device: DeviceId) {
        for (id, state) in self.devices.iter_mut() {
            if *id != device {
                state.valid = false;
            }
        }
        self.device_state_mut(device).mark_written();
        self.owner = Some(device);
        self.exclusive = true;
    }

    /// Host contents were copied to `device`
    pub fn record_copy_in(&mut self, device: DeviceId) {
        self.device_state_mut(device).mark_copied_in();
        if !self.exclusive {
            self.owner = Some(device);
        }
    }

    /// Contents of `device` were copied back to the host
    pub fn record_copy_out(&mut self, device: DeviceId) {
        self.device_state_mut(device).mark_copied_out();
        if self.owner == Some(device) {
            self.exclusive = false;
        }
    }

    pub fn first_copy_out_done(&self) -> bool {
        self.first_copy_out_done
    }

    pub fn set_first_copy_out_done(&mut self) {
        self.first_copy_out_done = true;
    }

    /// Deliver first-execution host transfers again
    pub fn clear_first_copy_out(&mut self) {
        self.first_copy_out_done = false;
    }

    /// Exclusive owner whose contents have not reached the host yet
    pub fn dirty_owner(&self) -> Option<DeviceId> {
        let owner = self.owner?;
        let state = self.devices.get(&owner)?;
        (self.exclusive && state.is_dirty() && state.is_valid() && state.has_buffer()).then_some(owner)
    }

    /// Every device copy must be refreshed; buffers stay attached
    pub fn invalidate(&mut self) {
        for state in self.devices.values_mut() {
            state.invalidate();
        }
        self.owner = None;
        self.exclusive = false;
        self.first_copy_out_done = false;
    }

    pub fn invalidate_device(&mut self, device: DeviceId) {
        if let Some(state) = self.devices.get_mut(&device) {
            state.invalidate();
        }
        if self.owner == Some(device) {
            self.owner = None;
            self.exclusive = false;
        }
    }

    /// Detach every buffer, returning them for release
    pub fn take_buffers(&mut self) -> Vec<BufferHandle> {
        let buffers = self
            .devices
            .values_mut()
            .filter_map(DeviceObjectState::take_buffer)
            .collect();
        self.owner = None;
        self.exclusive = false;
        buffers
    }

    /// Rebind this state to a new object of the same shape
    pub(crate) fn rebind(&mut self, object: ObjectId) {
        self.object = object;
        self.invalidate();
    }
}
