//! Type-erased stream payload.
//!
//! Every value flowing along an edge is wrapped in an [`Item`]: a cheaply
//! clonable, reference-counted envelope over an arbitrary `Send + Sync`
//! value. Cloning shares the underlying allocation, which keeps broadcast
//! routing (one item delivered to N consumer instances) allocation-free.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// An opaque stream payload.
///
/// Processors downcast to the concrete type they expect:
///
/// ```rust,ignore
/// let item = Item::new(42u64);
/// assert_eq!(item.downcast_ref::<u64>(), Some(&42));
/// ```
#[derive(Clone)]
pub struct Item(Arc<dyn Any + Send + Sync>);

impl Item {
    /// Wraps a value in an item envelope.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Returns a reference to the payload if it is of type `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Returns whether the payload is of type `T`.
    #[must_use]
    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }

    /// Converts into a shared handle to the payload if it is of type `T`.
    ///
    /// # Errors
    ///
    /// Returns the item unchanged if the payload is not a `T`.
    pub fn downcast<T: Any + Send + Sync>(self) -> Result<Arc<T>, Item> {
        self.0.downcast::<T>().map_err(Item)
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Item(<{:?}>)", (*self.0).type_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast_ref() {
        let item = Item::new(7u64);
        assert_eq!(item.downcast_ref::<u64>(), Some(&7));
        assert_eq!(item.downcast_ref::<i32>(), None);
        assert!(item.is::<u64>());
        assert!(!item.is::<String>());
    }

    #[test]
    fn test_clone_shares_payload() {
        let item = Item::new(String::from("shared"));
        let copy = item.clone();
        assert_eq!(copy.downcast_ref::<String>(), item.downcast_ref::<String>());
    }

    #[test]
    fn test_downcast_returns_item_on_mismatch() {
        let item = Item::new(1u8);
        let back = item.downcast::<u32>().unwrap_err();
        assert!(back.is::<u8>());
    }
}
