//! Class creation, registration and layout for the `objrt` runtime.
//!
//! A class goes through two phases:
//!
//! 1. **Allocated**: created with [`Class::allocate`]. Ivars may still be
//!    added and the class is not visible by name.
//! 2. **Registered**: [`Class::register`] publishes it in the global name
//!    table. From then on its instance layout is frozen, but methods,
//!    categories and protocols may still be added at any time.
//!
//! Classes are never unregistered. A `Class` is a `u32` handle into a
//! [`HandleArena`], so it is `Copy` and valid for the whole program.
//!
//! # Metaclasses
//!
//! Every class is allocated together with a metaclass holding its class
//! methods. The metaclass of a subclass inherits from the metaclass of its
//! superclass; the metaclass of a root class inherits from the root class
//! itself, so class objects also answer the root's instance methods. The
//! one instance of a metaclass is the class object
//! ([`Class::class_object`]), the receiver of class messages.
//!
//! # Initialization barrier
//!
//! Before the first message reaches a class (or its first instance is
//! allocated) the runtime runs [`Class::ensure_initialized`]: superclasses
//! first, then the dispatch table, then the class's own initializer. The
//! per-class reentrant lock makes other threads wait for an initializer in
//! progress while letting the initializing thread message the class freely.
//! A superclass is initialized before this class's lock is taken, so the
//! locks are only ever taken root first.
//!
//! # Thread Safety
//!
//! The name table, method tables, ivar lists and attachment lists are each
//! behind their own `RwLock`. Dispatch tables are rebuilt lazily; see
//! [`crate::runtime::dispatch`].

use crate::error::{Error, Result};
use crate::runtime::category::Category;
use crate::runtime::dispatch::DispatchTable;
use crate::runtime::encoding::{self, TypeInfo};
use crate::runtime::forwarding::ClassForwardingHook;
use crate::runtime::message::MessageArgs;
use crate::runtime::object::Object;
use crate::runtime::protocol::Protocol;
use crate::runtime::selector::Selector;
use crate::runtime::{FastMap, handles_exhausted, intern_str};
use objrt_log::{debug, info, trace};
use objrt_mem::HandleArena;
use parking_lot::{ReentrantMutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, OnceLock};

/// Method implementation function pointer type.
///
/// Implementations receive the receiver, the selector that was sent, the
/// explicit arguments and a return buffer. Scalar sends pass a
/// [`SCALAR_RETURN_SIZE`](crate::runtime::message::SCALAR_RETURN_SIZE)-byte
/// buffer; struct-returning sends pass the caller's buffer. Implementations
/// with a `void` return leave the buffer alone.
pub type Imp = fn(receiver: &Object, cmd: &Selector, args: &MessageArgs, ret: &mut [u8]);

/// Class has been published in the name table.
const REGISTERED: u32 = 1 << 0;
/// Initialization has started on some thread.
const INITIALIZING: u32 = 1 << 1;
/// Initialization has completed.
const INITIALIZED: u32 = 1 << 2;
/// Holds class methods rather than instance methods.
const META: u32 = 1 << 3;

/// Alignment that extra instance bytes start at.
const EXTRA_BYTES_ALIGN: usize = 16;

/// A method: selector, implementation and optional type encoding.
#[derive(Clone, Copy)]
pub struct Method {
    selector: Selector,
    imp: Imp,
    types: Option<&'static str>,
    /// Explicit argument count and whether a value is returned, when the
    /// type encoding is known and valid.
    signature: Option<(usize, bool)>,
}

fn signature_of(types: Option<&str>) -> Option<(usize, bool)> {
    let (ret, args) = encoding::parse_signature(types?).ok()?;
    Some((args.len() - 2, ret != "v"))
}

impl Method {
    /// Creates a method. The type encoding, if any, is taken from the
    /// selector.
    #[must_use]
    pub fn new(selector: Selector, imp: Imp) -> Self {
        Method {
            selector,
            imp,
            types: selector.types(),
            signature: signature_of(selector.types()),
        }
    }

    /// Sets the type encoding of this method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEncoding`] if `types` is not a valid method
    /// signature.
    pub fn with_types(mut self, types: &str) -> Result<Self> {
        encoding::validate_encoding(types)?;
        self.types = Some(intern_str(types));
        self.signature = signature_of(self.types);
        Ok(self)
    }

    #[inline]
    #[must_use]
    pub const fn selector(&self) -> Selector {
        self.selector
    }

    #[inline]
    #[must_use]
    pub const fn imp(&self) -> Imp {
        self.imp
    }

    #[inline]
    #[must_use]
    pub const fn types(&self) -> Option<&'static str> {
        self.types
    }

    /// Number of explicit arguments, if the type encoding is known.
    #[must_use]
    pub fn argument_count(&self) -> Option<usize> {
        self.signature.map(|(count, _)| count)
    }

    /// False only when the type encoding declares a `void` return.
    #[must_use]
    pub fn returns_value(&self) -> bool {
        self.signature.is_none_or(|(_, returns)| returns)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match self.types {
            Some(types) => encoding::validate_encoding(types),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("selector", &self.selector.name())
            .field("imp", &(self.imp as *const ()))
            .field("types", &self.types)
            .finish()
    }
}

/// A layout entry for one instance variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ivar {
    name: &'static str,
    types: &'static str,
    offset: usize,
    size: usize,
    class: Class,
}

impl Ivar {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// The class that declares this ivar.
    #[must_use]
    pub const fn class(&self) -> Class {
        self.class
    }

    #[must_use]
    pub const fn types(&self) -> &'static str {
        self.types
    }

    /// Byte offset from the start of instance storage.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// True if the ivar holds a strong object reference.
    #[must_use]
    pub fn is_object(&self) -> bool {
        encoding::is_object_type(self.types)
    }
}

pub(crate) struct ClassInner {
    name: &'static str,
    superclass: Option<Class>,
    flags: AtomicU32,
    /// Bytes of instance storage, inherited ivars included.
    instance_size: AtomicUsize,
    extra_bytes: usize,
    /// Offset of the extra bytes, fixed at registration.
    extra_offset: AtomicUsize,
    ivars: RwLock<Vec<Ivar>>,
    methods: RwLock<FastMap<u32, Method>>,
    pub(crate) categories: RwLock<Vec<Category>>,
    protocols: RwLock<Vec<Protocol>>,
    subclasses: RwLock<Vec<Class>>,
    pub(crate) dtable: RwLock<Option<Arc<DispatchTable>>>,
    /// Bumped by every invalidation; a rebuild only publishes its table if
    /// this did not move while it was building.
    pub(crate) dtable_epoch: AtomicU64,
    pub(crate) init_lock: ReentrantMutex<()>,
    initializer: RwLock<Option<fn(&Class)>>,
    forwarding_hook: RwLock<Option<ClassForwardingHook>>,
    /// The metaclass of a class, or the class of a metaclass.
    counterpart: AtomicU32,
    class_object: OnceLock<Object>,
}

impl ClassInner {
    fn new(name: &'static str, superclass: Option<Class>, flags: u32, instance_size: usize, extra_bytes: usize) -> Self {
        ClassInner {
            name,
            superclass,
            flags: AtomicU32::new(flags),
            instance_size: AtomicUsize::new(instance_size),
            extra_bytes,
            extra_offset: AtomicUsize::new(0),
            ivars: RwLock::new(Vec::new()),
            methods: RwLock::new(FastMap::default()),
            categories: RwLock::new(Vec::new()),
            protocols: RwLock::new(Vec::new()),
            subclasses: RwLock::new(Vec::new()),
            dtable: RwLock::new(None),
            dtable_epoch: AtomicU64::new(0),
            init_lock: ReentrantMutex::new(()),
            initializer: RwLock::new(None),
            forwarding_hook: RwLock::new(None),
            counterpart: AtomicU32::new(u32::MAX),
            class_object: OnceLock::new(),
        }
    }
}

fn push_class(inner: ClassInner) -> Class {
    match CLASSES.push(inner) {
        Ok(id) => Class { id },
        Err(_) => handles_exhausted("class"),
    }
}

static CLASSES: HandleArena<ClassInner> = HandleArena::new();

static REGISTRY: LazyLock<RwLock<FastMap<&'static str, Class>>> =
    LazyLock::new(|| RwLock::new(FastMap::default()));

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Handle to a class.
///
/// # Example
///
/// ```rust
/// use objrt::Class;
///
/// let root = Class::new_root("DocRoot").unwrap();
/// let child = Class::new("DocChild", &root).unwrap();
///
/// assert_eq!(child.superclass(), Some(root));
/// assert!(child.is_subclass_of(&root));
/// assert_eq!(Class::lookup("DocChild"), Some(child));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Class {
    id: u32,
}

impl Class {
    /// Creates a class that is not yet registered.
    ///
    /// `extra_bytes` of zeroed storage are reserved at the end of every
    /// instance, after all ivars; see [`Object::extra_bytes`].
    ///
    /// The class is linked under its superclass right away, so dispatch
    /// tables built before registration still see later edits to its
    /// ancestors.
    ///
    /// # Errors
    ///
    /// - [`Error::ClassAlreadyExists`] if a registered class has this name
    /// - [`Error::ClassNotRegistered`] if `superclass` is not registered
    /// - [`Error::NotInstantiable`] if `superclass` is a metaclass
    pub fn allocate(superclass: Option<&Class>, name: &str, extra_bytes: usize) -> Result<Class> {
        if REGISTRY.read().contains_key(name) {
            return Err(Error::ClassAlreadyExists {
                name: name.to_owned(),
            });
        }

        let instance_size = match superclass {
            Some(sup) if sup.is_meta() => {
                return Err(Error::NotInstantiable {
                    class: sup.name().to_owned(),
                });
            }
            Some(sup) if !sup.is_registered() => {
                return Err(Error::ClassNotRegistered {
                    name: sup.name().to_owned(),
                });
            }
            Some(sup) => sup.instance_size(),
            None => 0,
        };

        let name = intern_str(name);
        let class = push_class(ClassInner::new(
            name,
            superclass.copied(),
            0,
            instance_size,
            extra_bytes,
        ));
        let meta_super = superclass.map_or(class, Class::metaclass);
        let meta = push_class(ClassInner::new(name, Some(meta_super), META, 0, 0));
        meta.inner().counterpart.store(class.id, Ordering::Release);
        class.inner().counterpart.store(meta.id, Ordering::Release);

        if let Some(sup) = superclass {
            sup.inner().subclasses.write().push(class);
        }
        meta_super.inner().subclasses.write().push(meta);

        debug!("allocated class {} (id {}, metaclass {})", name, class.id, meta.id);
        Ok(class)
    }

    /// Publishes the class (and its metaclass) in the global name table and
    /// freezes its layout.
    ///
    /// # Errors
    ///
    /// - [`Error::ClassAlreadyRegistered`] if this class was registered
    ///   before, or is a metaclass
    /// - [`Error::ClassAlreadyExists`] if another class has taken the name
    pub fn register(&self) -> Result<()> {
        let inner = self.inner();
        let mut registry = REGISTRY.write();

        if inner.flags.load(Ordering::Acquire) & (REGISTERED | META) != 0 {
            return Err(Error::ClassAlreadyRegistered {
                name: inner.name.to_owned(),
            });
        }
        if registry.contains_key(inner.name) {
            return Err(Error::ClassAlreadyExists {
                name: inner.name.to_owned(),
            });
        }

        {
            // Holding the ivar lock orders this against a racing add_ivar
            let _ivars = inner.ivars.write();
            let extra_offset = align_up(inner.instance_size.load(Ordering::Relaxed), EXTRA_BYTES_ALIGN);
            inner.extra_offset.store(extra_offset, Ordering::Relaxed);
            inner
                .instance_size
                .store(extra_offset + inner.extra_bytes, Ordering::Relaxed);
            inner.flags.fetch_or(REGISTERED, Ordering::Release);
            self.metaclass()
                .inner()
                .flags
                .fetch_or(REGISTERED, Ordering::Release);
        }

        registry.insert(inner.name, *self);
        drop(registry);

        info!(
            "registered class {} (instance size {})",
            inner.name,
            self.instance_size()
        );
        Ok(())
    }

    /// Allocates and registers a root class.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClassAlreadyExists`] if the name is taken.
    pub fn new_root(name: &str) -> Result<Class> {
        let class = Class::allocate(None, name, 0)?;
        class.register()?;
        Ok(class)
    }

    /// Allocates and registers a subclass of `superclass`.
    ///
    /// # Errors
    ///
    /// See [`Class::allocate`] and [`Class::register`].
    pub fn new(name: &str, superclass: &Class) -> Result<Class> {
        let class = Class::allocate(Some(superclass), name, 0)?;
        class.register()?;
        Ok(class)
    }

    /// Finds a registered class by name.
    #[must_use]
    pub fn lookup(name: &str) -> Option<Class> {
        REGISTRY.read().get(name).copied()
    }

    /// Finds a registered class by name, failing if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClassNotFound`] if no registered class has this name.
    pub fn required(name: &str) -> Result<Class> {
        Class::lookup(name).ok_or_else(|| Error::ClassNotFound {
            name: name.to_owned(),
        })
    }

    /// Returns every registered class, in no particular order.
    #[must_use]
    pub fn all_classes() -> Vec<Class> {
        REGISTRY.read().values().copied().collect()
    }

    /// Number of registered classes.
    #[must_use]
    pub fn class_count() -> usize {
        REGISTRY.read().len()
    }

    pub(crate) fn inner(&self) -> &'static ClassInner {
        match CLASSES.get(self.id) {
            Some(inner) => inner,
            None => unreachable!("class handle {} was never allocated", self.id),
        }
    }

    pub(crate) const fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn from_id(id: u32) -> Option<Class> {
        CLASSES.get(id).map(|_| Class { id })
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.inner().name
    }

    #[must_use]
    pub fn superclass(&self) -> Option<Class> {
        self.inner().superclass
    }

    /// Iterates over this class and its ancestors, most derived first.
    pub fn ancestors(&self) -> impl Iterator<Item = Class> + use<> {
        std::iter::successors(Some(*self), Class::superclass)
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.inner().flags.load(Ordering::Acquire) & REGISTERED != 0
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner().flags.load(Ordering::Acquire) & INITIALIZED != 0
    }

    /// True for metaclasses.
    #[must_use]
    pub fn is_meta(&self) -> bool {
        self.inner().flags.load(Ordering::Relaxed) & META != 0
    }

    fn counterpart(&self) -> Class {
        Class {
            id: self.inner().counterpart.load(Ordering::Acquire),
        }
    }

    /// The metaclass of this class. For a metaclass this is the root
    /// metaclass, as every metaclass is an instance of it.
    #[must_use]
    pub fn metaclass(&self) -> Class {
        if self.is_meta() {
            self.ancestors()
                .take_while(Class::is_meta)
                .last()
                .unwrap_or(*self)
        } else {
            self.counterpart()
        }
    }

    /// The class whose instances this class describes: `self` for a class,
    /// the owning class for a metaclass.
    #[must_use]
    pub fn instance_class(&self) -> Class {
        if self.is_meta() { self.counterpart() } else { *self }
    }

    /// The class object, the one instance of the metaclass. It receives
    /// class messages and is never deallocated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClassNotRegistered`] before registration.
    pub fn class_object(&self) -> Result<&'static Object> {
        let class = self.instance_class();
        let inner = class.inner();
        if let Some(object) = inner.class_object.get() {
            return Ok(object);
        }
        let object = Object::allocate(&class.metaclass())?;
        Ok(inner.class_object.get_or_init(|| object))
    }

    /// Bytes of instance storage (inherited ivars and extra bytes included).
    #[must_use]
    pub fn instance_size(&self) -> usize {
        self.inner().instance_size.load(Ordering::Acquire)
    }

    /// Extra bytes requested when the class was allocated.
    #[must_use]
    pub fn extra_bytes(&self) -> usize {
        self.inner().extra_bytes
    }

    pub(crate) fn extra_offset(&self) -> usize {
        self.inner().extra_offset.load(Ordering::Acquire)
    }

    /// Returns true if `self` is `other` or one of its descendants.
    #[must_use]
    pub fn is_subclass_of(&self, other: &Class) -> bool {
        self.ancestors().any(|c| c == *other)
    }

    /// Returns the registered direct subclasses. For a metaclass these are
    /// the metaclasses of its class's subclasses.
    #[must_use]
    pub fn subclasses(&self) -> Vec<Class> {
        let meta = self.is_meta();
        self.inner()
            .subclasses
            .read()
            .iter()
            .copied()
            .filter(|sub| sub.is_meta() == meta && sub.is_registered())
            .collect()
    }

    /// Appends an ivar to the instance layout.
    ///
    /// The ivar is placed at the next offset suitably aligned for its type.
    ///
    /// # Errors
    ///
    /// - [`Error::ClassAlreadyRegistered`] once the layout is frozen (a
    ///   metaclass's layout always is)
    /// - [`Error::IvarAlreadyExists`] if this class or an ancestor already
    ///   declares `name`
    /// - [`Error::InvalidEncoding`] if `types` is not a single sized type
    pub fn add_ivar(&self, name: &str, types: &str) -> Result<Ivar> {
        let TypeInfo { size, align } = encoding::type_info(types)?;

        if self.superclass().is_some_and(|sup| sup.ivar(name).is_some()) {
            return Err(Error::IvarAlreadyExists {
                name: name.to_owned(),
            });
        }

        let inner = self.inner();
        let mut ivars = inner.ivars.write();
        if inner.flags.load(Ordering::Acquire) & (REGISTERED | META) != 0 {
            return Err(Error::ClassAlreadyRegistered {
                name: inner.name.to_owned(),
            });
        }
        if ivars.iter().any(|ivar| ivar.name == name) {
            return Err(Error::IvarAlreadyExists {
                name: name.to_owned(),
            });
        }

        let offset = align_up(inner.instance_size.load(Ordering::Relaxed), align.max(1));
        inner.instance_size.store(offset + size, Ordering::Release);

        let ivar = Ivar {
            name: intern_str(name),
            types: intern_str(types),
            offset,
            size,
            class: *self,
        };
        ivars.push(ivar);
        trace!("{}: ivar {} at offset {}", inner.name, name, offset);
        Ok(ivar)
    }

    /// Finds an ivar declared by this class or an ancestor.
    #[must_use]
    pub fn ivar(&self, name: &str) -> Option<Ivar> {
        self.ancestors()
            .find_map(|c| c.inner().ivars.read().iter().find(|ivar| ivar.name == name).copied())
    }

    /// Ivars declared by this class itself, in layout order.
    #[must_use]
    pub fn ivars(&self) -> Vec<Ivar> {
        self.inner().ivars.read().clone()
    }

    /// Adds a method to this class.
    ///
    /// # Errors
    ///
    /// - [`Error::MethodAlreadyExists`] if this class already declares the
    ///   selector (use [`Class::replace_method`] to override it)
    /// - [`Error::InvalidEncoding`] if the method's type encoding is invalid
    ///
    /// # Example
    ///
    /// ```rust
    /// use objrt::{Class, Method, MessageArgs, Object, Selector};
    ///
    /// fn ping(_obj: &Object, _sel: &Selector, _args: &MessageArgs, _ret: &mut [u8]) {}
    ///
    /// let class = Class::new_root("DocPinger").unwrap();
    /// let sel: Selector = "ping".parse().unwrap();
    /// class.add_method(Method::new(sel, ping)).unwrap();
    /// assert!(class.responds_to(&sel));
    /// assert!(class.add_method(Method::new(sel, ping)).is_err());
    /// ```
    pub fn add_method(&self, method: Method) -> Result<()> {
        method.validate()?;
        {
            let mut methods = self.inner().methods.write();
            let uid = method.selector.uid();
            if methods.contains_key(&uid) {
                return Err(Error::MethodAlreadyExists {
                    selector: method.selector.name().to_owned(),
                });
            }
            methods.insert(uid, method);
        }
        debug!("{}: added method {}", self.name(), method.selector.name());
        self.invalidate_dispatch_table();
        Ok(())
    }

    /// Adds or replaces this class's own method for a selector, returning the
    /// previous implementation.
    ///
    /// A method without a type encoding keeps the encoding of the method it
    /// replaces.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEncoding`] if the method's type encoding is
    /// invalid.
    pub fn replace_method(&self, mut method: Method) -> Result<Option<Imp>> {
        method.validate()?;
        let previous = {
            let mut methods = self.inner().methods.write();
            let uid = method.selector.uid();
            if let (None, Some(old)) = (method.types, methods.get(&uid)) {
                method.types = old.types;
                method.signature = old.signature;
            }
            methods.insert(uid, method)
        };
        debug!("{}: replaced method {}", self.name(), method.selector.name());
        self.invalidate_dispatch_table();
        Ok(previous.map(|old| old.imp))
    }

    /// Methods declared by this class itself (categories excluded).
    #[must_use]
    pub fn methods(&self) -> Vec<Method> {
        self.inner().methods.read().values().copied().collect()
    }

    /// Adds a class method, answered by the class object.
    ///
    /// # Errors
    ///
    /// As for [`Class::add_method`].
    pub fn add_class_method(&self, method: Method) -> Result<()> {
        self.metaclass().add_method(method)
    }

    /// Adds or replaces a class method; see [`Class::replace_method`].
    ///
    /// # Errors
    ///
    /// As for [`Class::replace_method`].
    pub fn replace_class_method(&self, method: Method) -> Result<Option<Imp>> {
        self.metaclass().replace_method(method)
    }

    /// Class methods declared by this class itself (categories excluded).
    #[must_use]
    pub fn class_methods(&self) -> Vec<Method> {
        self.metaclass().methods()
    }

    /// Returns true if the class object implements `sel`, inherited and
    /// category class methods included.
    #[must_use]
    pub fn responds_to_class_method(&self, sel: &Selector) -> bool {
        self.metaclass().responds_to(sel)
    }

    pub(crate) fn local_methods(&self) -> parking_lot::RwLockReadGuard<'static, FastMap<u32, Method>> {
        self.inner().methods.read()
    }

    /// Attaches a category, overlaying its methods on this class and its
    /// class methods on the metaclass. Attaching to a metaclass attaches to
    /// its class.
    ///
    /// # Errors
    ///
    /// - [`Error::CategoryAlreadyExists`] if a category with the same name is
    ///   attached to this class
    /// - [`Error::CategoryAlreadyAttached`] if the category is attached to
    ///   any class already
    pub fn add_category(&self, category: &Category) -> Result<()> {
        let class = self.instance_class();
        {
            let mut categories = class.inner().categories.write();
            if categories.iter().any(|c| c.name() == category.name()) {
                return Err(Error::CategoryAlreadyExists {
                    name: category.name().to_owned(),
                });
            }
            category.attach(class)?;
            categories.push(category.clone());
        }
        info!("{}: attached category {}", class.name(), category.name());
        class.invalidate_dispatch_table();
        class.metaclass().invalidate_dispatch_table();
        Ok(())
    }

    /// Categories attached to this class, in attachment order.
    #[must_use]
    pub fn categories(&self) -> Vec<Category> {
        self.instance_class().inner().categories.read().clone()
    }

    /// Declares that this class adopts `protocol`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolAlreadyAdopted`] if this class already
    /// declares it.
    pub fn add_protocol(&self, protocol: &Protocol) -> Result<()> {
        let mut protocols = self.inner().protocols.write();
        if protocols.contains(protocol) {
            return Err(Error::ProtocolAlreadyAdopted {
                name: protocol.name().to_owned(),
            });
        }
        protocols.push(*protocol);
        debug!("{}: adopted protocol {}", self.name(), protocol.name());
        Ok(())
    }

    /// Protocols declared by this class itself.
    #[must_use]
    pub fn protocols(&self) -> Vec<Protocol> {
        self.inner().protocols.read().clone()
    }

    /// Returns true if this class, an ancestor, or a category on either
    /// declares `protocol` or a protocol that inherits from it.
    ///
    /// Never fails; an unrelated protocol is simply `false`.
    #[must_use]
    pub fn conforms_to(&self, protocol: &Protocol) -> bool {
        self.ancestors().any(|class| {
            let inner = class.inner();
            inner.protocols.read().iter().any(|p| p.conforms_to(protocol))
                || inner
                    .categories
                    .read()
                    .iter()
                    .any(|cat| cat.protocols().iter().any(|p| p.conforms_to(protocol)))
        })
    }

    /// Checks that every required instance and class method of `protocol`
    /// (inherited ones included) is implemented.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingProtocolMethod`] naming the first missing
    /// selector.
    pub fn validate_protocol_conformance(&self, protocol: &Protocol) -> Result<()> {
        let class = self.instance_class();
        let meta = class.metaclass();
        let missing = protocol
            .all_required()
            .into_iter()
            .find(|sel| !class.responds_to(sel))
            .or_else(|| {
                protocol
                    .all_required_class_methods()
                    .into_iter()
                    .find(|sel| !meta.responds_to(sel))
            });
        match missing {
            Some(missing) => Err(Error::MissingProtocolMethod {
                selector: missing.name().to_owned(),
            }),
            None => Ok(()),
        }
    }

    /// Sets the function run once, before the class first receives a message
    /// or allocates an instance.
    pub fn set_initializer(&self, initializer: fn(&Class)) {
        *self.inner().initializer.write() = Some(initializer);
    }

    /// Runs the initialization barrier for this class if it has not run yet.
    ///
    /// Superclasses are initialized first. If another thread is initializing
    /// the class, this call waits for it to finish. A call made from inside
    /// the class's own initializer returns immediately. For a metaclass this
    /// initializes its class.
    pub fn ensure_initialized(&self) {
        let inner = self.inner();
        if inner.flags.load(Ordering::Acquire) & INITIALIZED != 0 {
            return;
        }
        if inner.flags.load(Ordering::Relaxed) & META != 0 {
            self.instance_class().ensure_initialized();
            return;
        }

        // Init locks are taken root first, never while holding a subclass's
        if let Some(sup) = inner.superclass {
            sup.ensure_initialized();
        }

        let _guard = inner.init_lock.lock();
        if inner.flags.load(Ordering::Acquire) & (INITIALIZED | INITIALIZING) != 0 {
            return;
        }
        inner.flags.fetch_or(INITIALIZING, Ordering::AcqRel);
        self.dispatch_table();

        let initializer = *inner.initializer.read();
        if let Some(initializer) = initializer {
            debug!("running initializer for {}", inner.name);
            initializer(self);
        }

        inner.flags.fetch_or(INITIALIZED, Ordering::Release);
        self.metaclass()
            .inner()
            .flags
            .fetch_or(INITIALIZED, Ordering::Release);
    }

    /// Installs a hook asked for a replacement receiver when an instance of
    /// this class gets a selector it does not implement.
    pub fn set_forwarding_hook(&self, hook: ClassForwardingHook) {
        *self.inner().forwarding_hook.write() = Some(hook);
    }

    pub fn clear_forwarding_hook(&self) {
        *self.inner().forwarding_hook.write() = None;
    }

    pub(crate) fn forwarding_hook(&self) -> Option<ClassForwardingHook> {
        self.ancestors()
            .find_map(|c| *c.inner().forwarding_hook.read())
    }

    /// Discards the dispatch table of this class and every descendant.
    pub(crate) fn invalidate_dispatch_table(&self) {
        let inner = self.inner();
        inner.dtable_epoch.fetch_add(1, Ordering::AcqRel);
        *inner.dtable.write() = None;
        trace!("invalidated dispatch table of {}", inner.name);

        let subclasses = inner.subclasses.read().clone();
        for sub in subclasses {
            sub.invalidate_dispatch_table();
        }
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name())
            .field("id", &self.id)
            .field("meta", &self.is_meta())
            .finish()
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
