//! Categories: named method sets overlaid on an existing class.
//!
//! A category's methods take precedence over the class's own methods for the
//! same selector, and a category attached later takes precedence over one
//! attached earlier. Categories may also declare protocols, which then count
//! towards the class's conformance.
//!
//! A category can also carry class methods, which are overlaid on the
//! target's metaclass in the same way.
//!
//! Methods can be added to a category before or after it is attached; either
//! way the target's dispatch table is rebuilt on the next send.

use crate::error::{Error, Result};
use crate::runtime::class::{Class, Method};
use crate::runtime::intern_str;
use crate::runtime::protocol::Protocol;
use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, OnceLock};

struct CategoryInner {
    name: &'static str,
    methods: RwLock<Vec<Method>>,
    class_methods: RwLock<Vec<Method>>,
    protocols: RwLock<Vec<Protocol>>,
    target: OnceLock<Class>,
}

/// A named set of methods (and protocols) attached to one class.
///
/// # Example
///
/// ```rust
/// use objrt::{Category, Class, Method, MessageArgs, Object, Selector};
///
/// fn describe(_obj: &Object, _sel: &Selector, _args: &MessageArgs, _ret: &mut [u8]) {}
///
/// let class = Class::new_root("DocCategoryTarget").unwrap();
/// let category = Category::new("Describing");
/// category
///     .add_method(Method::new("describe".parse().unwrap(), describe))
///     .unwrap();
///
/// class.add_category(&category).unwrap();
/// assert!(class.responds_to(&"describe".parse().unwrap()));
/// assert_eq!(category.target(), Some(class));
/// ```
#[derive(Clone)]
pub struct Category {
    inner: Arc<CategoryInner>,
}

impl Category {
    /// Creates an empty, unattached category.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Category {
            inner: Arc::new(CategoryInner {
                name: intern_str(name),
                methods: RwLock::new(Vec::new()),
                class_methods: RwLock::new(Vec::new()),
                protocols: RwLock::new(Vec::new()),
                target: OnceLock::new(),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// The class this category is attached to, if any.
    #[must_use]
    pub fn target(&self) -> Option<Class> {
        self.inner.target.get().copied()
    }

    /// Adds a method to this category.
    ///
    /// # Errors
    ///
    /// - [`Error::MethodAlreadyExists`] if the category already has one for
    ///   this selector
    /// - [`Error::InvalidEncoding`] if the method's type encoding is invalid
    pub fn add_method(&self, method: Method) -> Result<()> {
        Self::insert(&self.inner.methods, method)?;
        if let Some(target) = self.target() {
            target.invalidate_dispatch_table();
        }
        Ok(())
    }

    /// Adds a class method to this category.
    ///
    /// # Errors
    ///
    /// As for [`Category::add_method`], checked against the category's
    /// class methods.
    pub fn add_class_method(&self, method: Method) -> Result<()> {
        Self::insert(&self.inner.class_methods, method)?;
        if let Some(target) = self.target() {
            target.metaclass().invalidate_dispatch_table();
        }
        Ok(())
    }

    fn insert(list: &RwLock<Vec<Method>>, method: Method) -> Result<()> {
        method.validate()?;
        let mut methods = list.write();
        if methods.iter().any(|m| m.selector() == method.selector()) {
            return Err(Error::MethodAlreadyExists {
                selector: method.selector().name().to_owned(),
            });
        }
        methods.push(method);
        Ok(())
    }

    /// Methods in this category, in the order they were added.
    #[must_use]
    pub fn methods(&self) -> Vec<Method> {
        self.inner.methods.read().clone()
    }

    /// Class methods in this category, in the order they were added.
    #[must_use]
    pub fn class_methods(&self) -> Vec<Method> {
        self.inner.class_methods.read().clone()
    }

    /// Declares that this category adopts `protocol`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolAlreadyAdopted`] if it already does.
    pub fn add_protocol(&self, protocol: &Protocol) -> Result<()> {
        let mut protocols = self.inner.protocols.write();
        if protocols.contains(protocol) {
            return Err(Error::ProtocolAlreadyAdopted {
                name: protocol.name().to_owned(),
            });
        }
        protocols.push(*protocol);
        Ok(())
    }

    #[must_use]
    pub fn protocols(&self) -> Vec<Protocol> {
        self.inner.protocols.read().clone()
    }

    pub(crate) fn attach(&self, class: Class) -> Result<()> {
        self.inner
            .target
            .set(class)
            .map_err(|_| Error::CategoryAlreadyAttached {
                name: self.inner.name.to_owned(),
            })
    }
}

impl fmt::Debug for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Category")
            .field("name", &self.name())
            .field("target", &self.target().map(|c| c.name()))
            .field("methods", &self.inner.methods.read().len())
            .finish()
    }
}
