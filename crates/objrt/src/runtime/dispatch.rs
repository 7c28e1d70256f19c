//! Message dispatch for the `objrt` runtime.
//!
//! Each class owns a lazily built dispatch table mapping selector uids to
//! methods. A table is built by layering, from the root ancestor down to the
//! class itself, each level's own methods followed by its categories in
//! attachment order. Later layers override earlier ones, so the most derived
//! and most recently attached implementation wins.
//!
//! # Invalidation
//!
//! Adding or replacing a method, attaching a category, or adding a method
//! to an attached category discards the table of the affected class and of
//! all its descendants. The next send rebuilds it. Rebuilds are serialized by
//! the class's initialization lock and only publish a table if no
//! invalidation happened while it was being built.
//!
//! # Dispatch
//!
//! 1. Run the class's initialization barrier (a no-op after the first time).
//! 2. Look the selector up in the table; on a miss against a table that was
//!    invalidated since it was fetched, rebuild once and look again.
//! 3. Check the argument count against the method's type encoding, if known.
//! 4. Call the implementation.
//! 5. If nothing was found, hand over to [`crate::runtime::forwarding`].
//!
//! Struct-returning sends use [`send_message_stret`]. The caller picks the
//! variant; it only changes which forward handler applies on a miss.
//!
//! Class messages go to the class object and resolve through the
//! metaclass chain, where categories contribute their class methods.
//!
//! # Example
//!
//! ```rust
//! use objrt::{Class, Method, MessageArgs, Object, Selector, send_message};
//! use objrt::runtime::message::write_return;
//!
//! fn answer(_obj: &Object, _sel: &Selector, _args: &MessageArgs, ret: &mut [u8]) {
//!     write_return(ret, 42usize);
//! }
//!
//! let class = Class::new_root("DocOracle").unwrap();
//! let sel = Selector::with_types("answer", "Q@:").unwrap();
//! class.add_method(Method::new(sel, answer)).unwrap();
//!
//! let obj = Object::new(&class).unwrap();
//! assert_eq!(send_message(&obj, &sel, &MessageArgs::None).unwrap(), Some(42));
//! ```

use crate::error::{Error, Result};
use crate::runtime::class::{Class, Imp, Method};
use crate::runtime::exception::raise;
use crate::runtime::forwarding::{self, Forwarded, ForwardingScope};
use crate::runtime::message::{MessageArgs, SCALAR_RETURN_SIZE, read_return};
use crate::runtime::object::Object;
use crate::runtime::selector::Selector;
use crate::runtime::FastMap;
use objrt_log::trace;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Resolved selector-to-method mapping for one class.
pub(crate) struct DispatchTable {
    methods: FastMap<u32, Method>,
    epoch: u64,
}

impl DispatchTable {
    fn build(class: Class, epoch: u64) -> Self {
        let chain: Vec<Class> = class.ancestors().collect();
        let mut methods = FastMap::default();

        for level in chain.iter().rev() {
            for (uid, method) in level.local_methods().iter() {
                methods.insert(*uid, *method);
            }
            let meta = level.is_meta();
            for category in level.instance_class().inner().categories.read().iter() {
                let layer = if meta {
                    category.class_methods()
                } else {
                    category.methods()
                };
                for method in layer {
                    methods.insert(method.selector().uid(), method);
                }
            }
        }

        DispatchTable { methods, epoch }
    }

    fn get(&self, sel: &Selector) -> Option<Method> {
        self.methods.get(&sel.uid()).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.methods.len()
    }
}

impl Class {
    /// Returns the current dispatch table, building it if necessary.
    pub(crate) fn dispatch_table(&self) -> Arc<DispatchTable> {
        if let Some(table) = self.inner().dtable.read().as_ref() {
            return Arc::clone(table);
        }
        self.rebuild_dispatch_table()
    }

    fn rebuild_dispatch_table(&self) -> Arc<DispatchTable> {
        let inner = self.inner();
        let _guard = inner.init_lock.lock();

        loop {
            let epoch = inner.dtable_epoch.load(Ordering::Acquire);
            if let Some(table) = inner.dtable.read().as_ref() {
                if table.epoch == epoch {
                    return Arc::clone(table);
                }
            }

            let table = Arc::new(DispatchTable::build(*self, epoch));
            let mut slot = inner.dtable.write();
            if inner.dtable_epoch.load(Ordering::Acquire) == epoch {
                trace!(
                    "built dispatch table for {} ({} selectors)",
                    self.name(),
                    table.len()
                );
                *slot = Some(Arc::clone(&table));
                return table;
            }
        }
    }

    /// Finds the method a send of `sel` to an instance of this class would
    /// run: own methods, categories and inherited methods, most derived
    /// first.
    #[must_use]
    pub fn lookup_method(&self, sel: &Selector) -> Option<Method> {
        let table = self.dispatch_table();
        if let Some(method) = table.get(sel) {
            return Some(method);
        }
        if table.epoch == self.inner().dtable_epoch.load(Ordering::Acquire) {
            return None;
        }
        // The table was invalidated after we fetched it
        self.rebuild_dispatch_table().get(sel)
    }

    /// Returns true if instances of this class implement `sel`.
    #[must_use]
    pub fn responds_to(&self, sel: &Selector) -> bool {
        self.lookup_method(sel).is_some()
    }

    /// Returns the implementation a scalar send of `sel` would run.
    ///
    /// If the class has no implementation this is the scalar forward
    /// handler, or a stand-in that raises
    /// [`Error::UnrecognizedSelector`] when called.
    #[must_use]
    pub fn method_imp(&self, sel: &Selector) -> Imp {
        lookup_imp(*self, sel, false)
    }

    /// Like [`Class::method_imp`], for struct-returning sends.
    #[must_use]
    pub fn method_imp_stret(&self, sel: &Selector) -> Imp {
        lookup_imp(*self, sel, true)
    }

    /// Type encoding of the method a send of `sel` would run.
    #[must_use]
    pub fn method_type_encoding(&self, sel: &Selector) -> Option<&'static str> {
        self.lookup_method(sel).and_then(|m| m.types())
    }
}

fn lookup_imp(class: Class, sel: &Selector, stret: bool) -> Imp {
    class
        .lookup_method(sel)
        .map(|m| m.imp())
        .or_else(|| forwarding::forward_handler(stret))
        .unwrap_or(unrecognized)
}

fn unrecognized(receiver: &Object, cmd: &Selector, _args: &MessageArgs, _ret: &mut [u8]) {
    raise(Error::UnrecognizedSelector {
        class: receiver.class().name().to_owned(),
        selector: cmd.name().to_owned(),
    })
}

/// Returns the implementation a scalar send of `sel` to `receiver` would
/// run, without running it.
///
/// Never fails: a missing implementation yields the scalar forward handler
/// or a stand-in that raises [`Error::UnrecognizedSelector`]. Class
/// forwarding hooks are not consulted, since they change the receiver.
#[must_use]
pub fn msg_lookup(receiver: &Object, sel: &Selector) -> Imp {
    let class = receiver.class();
    class.ensure_initialized();
    lookup_imp(class, sel, false)
}

/// Like [`msg_lookup`], for struct-returning sends.
#[must_use]
pub fn msg_lookup_stret(receiver: &Object, sel: &Selector) -> Imp {
    let class = receiver.class();
    class.ensure_initialized();
    lookup_imp(class, sel, true)
}

/// Sends a message and returns its result as a machine word.
///
/// Returns `Ok(None)` when the method's type encoding declares a `void`
/// return, `Ok(Some(word))` otherwise (the first word of the return buffer).
///
/// # Errors
///
/// - [`Error::UnrecognizedSelector`] if neither the receiver nor any
///   forwarding path handles `sel`
/// - [`Error::ArgumentCountMismatch`] if `args` does not match the method's
///   type encoding
/// - [`Error::ForwardingLoopDetected`] if redirected sends nest too deeply
pub fn send_message(receiver: &Object, sel: &Selector, args: &MessageArgs) -> Result<Option<usize>> {
    let mut ret = [0u8; SCALAR_RETURN_SIZE];
    let returns = dispatch(receiver, receiver.class(), sel, args, &mut ret, false)?;
    Ok(returns.then(|| read_return::<usize>(&ret)))
}

/// Sends a message whose implementation writes a struct into `out`.
///
/// # Errors
///
/// As for [`send_message`].
pub fn send_message_stret(
    receiver: &Object,
    sel: &Selector,
    args: &MessageArgs,
    out: &mut [u8],
) -> Result<()> {
    dispatch(receiver, receiver.class(), sel, args, out, true).map(|_| ())
}

/// Sends a class message to the class object of `class`.
///
/// # Errors
///
/// - [`Error::ClassNotRegistered`] if `class` is not registered
/// - otherwise as for [`send_message`]
pub fn send_class_message(class: &Class, sel: &Selector, args: &MessageArgs) -> Result<Option<usize>> {
    send_message(class.class_object()?, sel, args)
}

/// Sends a message to `receiver`, starting the method search at the
/// superclass of `class`.
///
/// `class` is the class whose implementation is making the call, not
/// necessarily the receiver's class.
///
/// # Errors
///
/// As for [`send_message`]; a root `class` has no superclass and yields
/// [`Error::UnrecognizedSelector`].
pub fn send_super(
    receiver: &Object,
    class: &Class,
    sel: &Selector,
    args: &MessageArgs,
) -> Result<Option<usize>> {
    let Some(superclass) = class.superclass() else {
        return Err(Error::UnrecognizedSelector {
            class: class.name().to_owned(),
            selector: sel.name().to_owned(),
        });
    };
    let mut ret = [0u8; SCALAR_RETURN_SIZE];
    let returns = dispatch(receiver, superclass, sel, args, &mut ret, false)?;
    Ok(returns.then(|| read_return::<usize>(&ret)))
}

fn dispatch(
    receiver: &Object,
    class: Class,
    sel: &Selector,
    args: &MessageArgs,
    ret: &mut [u8],
    stret: bool,
) -> Result<bool> {
    class.ensure_initialized();

    if let Some(method) = class.lookup_method(sel) {
        if let Some(expected) = method.argument_count() {
            if expected != args.count() {
                return Err(Error::ArgumentCountMismatch {
                    expected,
                    got: args.count(),
                });
            }
        }
        (method.imp())(receiver, sel, args, ret);
        return Ok(method.returns_value());
    }

    let _scope = ForwardingScope::enter(class, sel)?;
    match forwarding::resolve(receiver, sel, stret)? {
        Forwarded::Redirect(target) => dispatch(&target, target.class(), sel, args, ret, stret),
        Forwarded::Handler(handler) => {
            handler(receiver, sel, args, ret);
            Ok(true)
        }
    }
}
