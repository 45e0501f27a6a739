//! Host objects exposed to scripts
//!
//! A `UserData` pairs an opaque host object with a descriptor that tells the
//! VM how to index it, how to compare it and which intrinsic metamethods it
//! offers. An optional per-object metatable takes precedence over the
//! descriptor's meta-index during metamethod lookup.

use std::any::Any;
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;

use super::{TableRef, Value};
use crate::error::ScriptResult;

/// Describes how scripts interact with a kind of host object
pub trait UserDataDescriptor {
    /// Type name reported in messages
    fn name(&self) -> &str;

    /// `obj[key]`; `Ok(None)` means the member does not exist
    fn index(&self, obj: &UserData, key: &Value) -> ScriptResult<Option<Value>>;

    /// `obj[key] = value`; `Ok(false)` means the member cannot be set
    fn set_index(&self, obj: &UserData, key: &Value, value: Value) -> ScriptResult<bool>;

    /// Intrinsic metamethod lookup (e.g. "__add"), consulted after metatables
    fn meta_index(&self, _obj: &UserData, _name: &str) -> Option<Value> {
        None
    }

    /// Equality between two objects sharing this descriptor
    fn equals(&self, a: &UserData, b: &UserData) -> bool {
        std::ptr::eq(a, b)
    }

    /// String form used by `tostring`
    fn as_string(&self, _obj: &UserData) -> Option<String> {
        None
    }
}

/// A host object reachable from scripts
pub struct UserData {
    object: RefCell<Box<dyn Any>>,
    descriptor: Rc<dyn UserDataDescriptor>,
    metatable: RefCell<Option<TableRef>>,
}

impl UserData {
    pub fn new<T: Any>(object: T, descriptor: Rc<dyn UserDataDescriptor>) -> Self {
        UserData {
            object: RefCell::new(Box::new(object)),
            descriptor,
            metatable: RefCell::new(None),
        }
    }

    pub fn descriptor(&self) -> &Rc<dyn UserDataDescriptor> {
        &self.descriptor
    }

    /// Borrow the host object as `T`
    pub fn borrow<T: Any>(&self) -> Option<Ref<'_, T>> {
        Ref::filter_map(self.object.borrow(), |o| o.downcast_ref::<T>()).ok()
    }

    /// Mutably borrow the host object as `T`
    pub fn borrow_mut<T: Any>(&self) -> Option<RefMut<'_, T>> {
        RefMut::filter_map(self.object.borrow_mut(), |o| o.downcast_mut::<T>()).ok()
    }

    pub fn metatable(&self) -> Option<TableRef> {
        self.metatable.borrow().clone()
    }

    pub fn set_metatable(&self, metatable: Option<TableRef>) {
        *self.metatable.borrow_mut() = metatable;
    }
}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserData({})", self.descriptor.name())
    }
}
