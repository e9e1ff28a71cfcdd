//! Execution-context id allocator.

use crate::error::{KgslError, KgslResult};
use crate::kgsl::device::DrawContext;
use std::fmt;

/// Identifies one open handle on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file#{}", self.0)
    }
}

/// A command submission context, owned by the handle that created it.
#[derive(Debug)]
pub struct ExecutionContext {
    pub id: u32,
    pub owner: FileId,
    /// Device-specific state; must be handed back to the device before the id is freed.
    pub devctxt: Option<DrawContext>,
}

/// Dense id space for execution contexts. New contexts always get the lowest free id.
#[derive(Debug)]
pub struct ContextRegistry {
    slots: Vec<Option<ExecutionContext>>,
    max: usize,
}

impl ContextRegistry {
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            slots: Vec::new(),
            max,
        }
    }

    /// Reserves the lowest free id for `owner`.
    pub fn create(&mut self, owner: FileId) -> KgslResult<u32> {
        let slot = match self.slots.iter().position(Option::is_none) {
            Some(slot) => slot,
            None if self.slots.len() < self.max => {
                self.slots.push(None);
                self.slots.len() - 1
            }
            None => {
                return Err(KgslError::ResourceExhausted(format!(
                    "all {} context ids in use",
                    self.max
                )));
            }
        };

        let id = u32::try_from(slot)
            .map_err(|_| KgslError::ResourceExhausted("context id space".into()))?;
        self.slots[slot] = Some(ExecutionContext {
            id,
            owner,
            devctxt: None,
        });
        Ok(id)
    }

    /// The context `id`, if it exists and belongs to `owner`.
    #[must_use]
    pub fn find(&self, owner: FileId, id: u32) -> Option<&ExecutionContext> {
        self.slots
            .get(id as usize)?
            .as_ref()
            .filter(|ctx| ctx.owner == owner)
    }

    pub fn find_mut(&mut self, owner: FileId, id: u32) -> Option<&mut ExecutionContext> {
        self.slots
            .get_mut(id as usize)?
            .as_mut()
            .filter(|ctx| ctx.owner == owner)
    }

    /// Frees the id. The device-specific state must already have been detached.
    ///
    /// # Panics
    ///
    /// Panics if the context still carries device state: freeing the id would leak it.
    pub fn destroy(&mut self, owner: FileId, id: u32) -> KgslResult<()> {
        let slot = self
            .slots
            .get_mut(id as usize)
            .filter(|s| s.as_ref().is_some_and(|ctx| ctx.owner == owner))
            .ok_or_else(|| KgslError::NotFound(format!("context {id} for {owner}")))?;

        if let Some(ctx) = slot.take() {
            assert!(
                ctx.devctxt.is_none(),
                "context {id} destroyed with device state attached"
            );
        }

        while self.slots.last().is_some_and(Option::is_none) {
            self.slots.pop();
        }
        Ok(())
    }

    /// Ids of every context owned by `owner`, lowest first.
    #[must_use]
    pub fn owned_by(&self, owner: FileId) -> Vec<u32> {
        self.slots
            .iter()
            .flatten()
            .filter(|ctx| ctx.owner == owner)
            .map(|ctx| ctx.id)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
