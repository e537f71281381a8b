use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::Arc,
};

/// Values of arbitrary types carried alongside an activity, keyed by type. Cloning is cheap since
/// the values themselves are shared.
#[derive(Default, Clone)]
pub struct AppData {
    map: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl AppData {
    /// Insert an item, overwriting any existing item of the same type
    pub fn insert<T: Send + Sync + 'static>(&mut self, val: T) {
        self.map.insert(TypeId::of::<T>(), Arc::new(val));
    }

    /// Get a reference to a type in the map
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref())
    }
}

impl fmt::Debug for AppData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppData")
            .field("entries", &self.map.len())
            .finish()
    }
}
