use bevy::utils::HashMap;
use std::any::{Any, TypeId};

/// Per cell state owned by the feeder, renderer and collider.
///
/// Each subsystem stores its own type, at most one value per type.
/// Everything is dropped when the cell unloads.
#[derive(Default)]
pub struct CellAttachments {
    slots: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl CellAttachments {
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.slots
            .get(&TypeId::of::<T>())
            .and_then(|slot| slot.downcast_ref())
    }

    pub fn get_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.slots
            .get_mut(&TypeId::of::<T>())
            .and_then(|slot| slot.downcast_mut())
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.slots.contains_key(&TypeId::of::<T>())
    }

    /// Stores `value`, returning the previous value of the same type.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<T> {
        self.slots
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|previous| previous.downcast().ok())
            .map(|previous| *previous)
    }

    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.slots
            .remove(&TypeId::of::<T>())
            .and_then(|slot| slot.downcast().ok())
            .map(|slot| *slot)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RenderSlot(u32);
    struct CollisionSlot(&'static str);

    #[test]
    fn slots_are_typed() {
        let mut attachments = CellAttachments::default();

        assert!(attachments.insert(RenderSlot(1)).is_none());
        assert!(attachments.insert(CollisionSlot("mesh")).is_none());
        assert_eq!(attachments.insert(RenderSlot(2)).map(|slot| slot.0), Some(1));

        attachments.get_mut::<RenderSlot>().unwrap().0 += 1;
        assert_eq!(attachments.get::<RenderSlot>().unwrap().0, 3);
        assert_eq!(attachments.len(), 2);

        assert_eq!(attachments.remove::<CollisionSlot>().map(|slot| slot.0), Some("mesh"));
        assert!(!attachments.contains::<CollisionSlot>());

        attachments.clear();
        assert!(attachments.is_empty());
    }
}
