//! Shared data for projection handlers.
//!
//! Values are stored and looked up by their Rust type. A [`Context`] is
//! cheap to clone; clones see the same values.
//!
//! ```rust,ignore
//! let projection = Projection::new("balances", checkpoints)
//!     .data(Data::new(pool))
//!     .handler("deposited", Deposited);
//!
//! // inside a handler
//! let pool: Data<PgPool> = context.extract();
//! ```

use parking_lot::RwLock;
use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
    fmt,
    ops::Deref,
    sync::Arc,
};

type Map = HashMap<TypeId, Box<dyn Any + Send + Sync>>;

#[derive(Clone, Default)]
pub struct Context(Arc<RwLock<Map>>);

impl Context {
    /// Stores `value`, returning the previous value of the same type.
    pub fn insert<T: Send + Sync + 'static>(&self, value: T) -> Option<T> {
        self.0
            .write()
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|boxed| boxed.downcast().ok().map(|boxed| *boxed))
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.0.read().contains_key(&TypeId::of::<T>())
    }

    pub fn get<T: Clone + 'static>(&self) -> Option<T> {
        self.0
            .read()
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<T>())
            .cloned()
    }

    /// Like [`Context::get`], for data the projection cannot work without.
    ///
    /// # Panics
    ///
    /// Panics if no value of type `T` was inserted.
    pub fn extract<T: Clone + 'static>(&self) -> T {
        match self.get::<T>() {
            Some(value) => value,
            _ => {
                tracing::debug!(
                    "`{}` is missing from the projection context, register it with `Projection::data()`",
                    type_name::<T>()
                );

                panic!("Requested projection data is not configured correctly. View/enable debug logs for more details.");
            }
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("len", &self.0.read().len())
            .finish()
    }
}

/// `Arc` wrapper for data shared between handlers.
#[derive(Debug)]
pub struct Data<T: ?Sized>(Arc<T>);

impl<T> Data<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(value))
    }
}

impl<T: ?Sized> Deref for Data<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: ?Sized> Clone for Data<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: ?Sized> From<Arc<T>> for Data<T> {
    fn from(value: Arc<T>) -> Self {
        Self(value)
    }
}
