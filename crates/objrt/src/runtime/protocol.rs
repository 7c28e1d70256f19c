//! Protocols: named interface contracts.
//!
//! A protocol lists required and optional selectors, for instances and for
//! the class object, and may inherit from other protocols. Conformance is transitive over that inheritance: a class
//! that adopts `B`, where `B` inherits from `A`, conforms to `A` too.
//!
//! Protocols are compared by name and are never unregistered. Parents are
//! fixed at creation and must already exist, so the inheritance graph cannot
//! contain a cycle.

use crate::error::{Error, Result};
use crate::runtime::selector::Selector;
use crate::runtime::{FastMap, handles_exhausted, intern_str};
use objrt_log::debug;
use objrt_mem::HandleArena;
use parking_lot::RwLock;
use std::fmt;
use std::sync::LazyLock;

#[derive(Default)]
struct MethodLists {
    required: Vec<Selector>,
    optional: Vec<Selector>,
}

struct ProtocolInner {
    name: &'static str,
    parents: Box<[Protocol]>,
    instance: RwLock<MethodLists>,
    class: RwLock<MethodLists>,
}

impl ProtocolInner {
    fn lists(&self, class_side: bool) -> &RwLock<MethodLists> {
        if class_side { &self.class } else { &self.instance }
    }
}

static PROTOCOLS: HandleArena<ProtocolInner> = HandleArena::new();

static PROTOCOL_NAMES: LazyLock<RwLock<FastMap<&'static str, Protocol>>> =
    LazyLock::new(|| RwLock::new(FastMap::default()));

/// Handle to a registered protocol.
///
/// # Example
///
/// ```rust
/// use objrt::Protocol;
///
/// let copying = Protocol::new("DocCopying", &[]).unwrap();
/// let mutable = Protocol::new("DocMutableCopying", &[copying]).unwrap();
///
/// assert!(mutable.conforms_to(&copying));
/// assert!(!copying.conforms_to(&mutable));
/// assert_eq!(Protocol::lookup("DocCopying"), Some(copying));
/// ```
#[derive(Clone, Copy)]
pub struct Protocol {
    id: u32,
}

impl Protocol {
    /// Creates and registers a protocol inheriting from `parents`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolAlreadyExists`] if the name is taken.
    pub fn new(name: &str, parents: &[Protocol]) -> Result<Protocol> {
        let mut names = PROTOCOL_NAMES.write();
        if names.contains_key(name) {
            return Err(Error::ProtocolAlreadyExists {
                name: name.to_owned(),
            });
        }

        let name = intern_str(name);
        let id = match PROTOCOLS.push(ProtocolInner {
            name,
            parents: parents.into(),
            instance: RwLock::default(),
            class: RwLock::default(),
        }) {
            Ok(id) => id,
            Err(_) => handles_exhausted("protocol"),
        };

        let protocol = Protocol { id };
        names.insert(name, protocol);
        debug!("registered protocol {}", name);
        Ok(protocol)
    }

    /// Finds a protocol by name.
    #[must_use]
    pub fn lookup(name: &str) -> Option<Protocol> {
        PROTOCOL_NAMES.read().get(name).copied()
    }

    /// Every registered protocol, in no particular order.
    #[must_use]
    pub fn all_protocols() -> Vec<Protocol> {
        PROTOCOL_NAMES.read().values().copied().collect()
    }

    fn inner(&self) -> &'static ProtocolInner {
        match PROTOCOLS.get(self.id) {
            Some(inner) => inner,
            None => unreachable!("protocol handle {} was never allocated", self.id),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.inner().name
    }

    /// Protocols this one directly inherits from.
    #[must_use]
    pub fn parents(&self) -> &'static [Protocol] {
        &self.inner().parents
    }

    /// Adds a required method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolMethodAlreadyRegistered`] if the selector is
    /// already listed, required or optional.
    pub fn add_required(&self, selector: Selector) -> Result<()> {
        self.add(selector, true, false)
    }

    /// Adds an optional method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolMethodAlreadyRegistered`] if the selector is
    /// already listed, required or optional.
    pub fn add_optional(&self, selector: Selector) -> Result<()> {
        self.add(selector, false, false)
    }

    /// Adds a required class method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolMethodAlreadyRegistered`] if the selector is
    /// already listed as a class method.
    pub fn add_required_class_method(&self, selector: Selector) -> Result<()> {
        self.add(selector, true, true)
    }

    /// Adds an optional class method.
    ///
    /// # Errors
    ///
    /// As for [`Protocol::add_required_class_method`].
    pub fn add_optional_class_method(&self, selector: Selector) -> Result<()> {
        self.add(selector, false, true)
    }

    fn add(&self, selector: Selector, required: bool, class_side: bool) -> Result<()> {
        let mut lists = self.inner().lists(class_side).write();
        if lists.required.contains(&selector) || lists.optional.contains(&selector) {
            return Err(Error::ProtocolMethodAlreadyRegistered {
                selector: selector.name().to_owned(),
            });
        }
        if required {
            lists.required.push(selector);
        } else {
            lists.optional.push(selector);
        }
        Ok(())
    }

    /// Required methods declared directly by this protocol.
    #[must_use]
    pub fn required(&self) -> Vec<Selector> {
        self.inner().instance.read().required.clone()
    }

    /// Optional methods declared directly by this protocol.
    #[must_use]
    pub fn optional(&self) -> Vec<Selector> {
        self.inner().instance.read().optional.clone()
    }

    /// Required class methods declared directly by this protocol.
    #[must_use]
    pub fn required_class_methods(&self) -> Vec<Selector> {
        self.inner().class.read().required.clone()
    }

    /// Optional class methods declared directly by this protocol.
    #[must_use]
    pub fn optional_class_methods(&self) -> Vec<Selector> {
        self.inner().class.read().optional.clone()
    }

    /// Required methods of this protocol and all its ancestors, without
    /// duplicates.
    #[must_use]
    pub fn all_required(&self) -> Vec<Selector> {
        self.collect_required(false)
    }

    /// Required class methods of this protocol and all its ancestors,
    /// without duplicates.
    #[must_use]
    pub fn all_required_class_methods(&self) -> Vec<Selector> {
        self.collect_required(true)
    }

    fn collect_required(&self, class_side: bool) -> Vec<Selector> {
        let mut out = Vec::new();
        self.walk(&mut Vec::new(), &mut |p| {
            for sel in &p.inner().lists(class_side).read().required {
                if !out.contains(sel) {
                    out.push(*sel);
                }
            }
            false
        });
        out
    }

    /// Returns true if this protocol is `other` or inherits from it, directly
    /// or transitively.
    #[must_use]
    pub fn conforms_to(&self, other: &Protocol) -> bool {
        self.walk(&mut Vec::new(), &mut |p| p == other)
    }

    /// Depth-first walk over this protocol and its ancestors, each visited
    /// once. Stops early when `visit` returns true.
    fn walk(&self, seen: &mut Vec<u32>, visit: &mut dyn FnMut(&Protocol) -> bool) -> bool {
        if seen.contains(&self.id) {
            return false;
        }
        seen.push(self.id);
        if visit(self) {
            return true;
        }
        self.parents().iter().any(|parent| parent.walk(seen, visit))
    }
}

impl PartialEq for Protocol {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id || self.name() == other.name()
    }
}

impl Eq for Protocol {}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name())
            .field(
                "parents",
                &self.parents().iter().map(Protocol::name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::class::{Class, Method};
    use crate::runtime::message::MessageArgs;
    use crate::runtime::object::Object;
    use std::str::FromStr;

    fn noop(_obj: &Object, _sel: &Selector, _args: &MessageArgs, _ret: &mut [u8]) {}

    #[test]
    fn test_protocol_registry() {
        let p = Protocol::new("ProtocolTestRegistry", &[]).unwrap();
        assert_eq!(Protocol::lookup("ProtocolTestRegistry"), Some(p));
        assert!(Protocol::all_protocols().contains(&p));
        assert!(matches!(
            Protocol::new("ProtocolTestRegistry", &[]),
            Err(Error::ProtocolAlreadyExists { .. })
        ));
    }

    #[test]
    fn test_transitive_conformance() {
        let a = Protocol::new("ProtocolTestA", &[]).unwrap();
        let b = Protocol::new("ProtocolTestB", &[a]).unwrap();
        let c = Protocol::new("ProtocolTestC", &[b]).unwrap();
        let unrelated = Protocol::new("ProtocolTestUnrelated", &[]).unwrap();

        assert!(c.conforms_to(&a));
        assert!(c.conforms_to(&c));
        assert!(!a.conforms_to(&c));
        assert!(!c.conforms_to(&unrelated));

        let class = Class::new_root("ProtocolTestAdopter").unwrap();
        let child = Class::new("ProtocolTestAdopterChild", &class).unwrap();
        class.add_protocol(&c).unwrap();
        assert!(child.conforms_to(&a));
        assert!(!child.conforms_to(&unrelated));
        assert!(matches!(
            class.add_protocol(&c),
            Err(Error::ProtocolAlreadyAdopted { .. })
        ));
    }

    #[test]
    fn test_diamond_required_methods() {
        let base = Protocol::new("ProtocolTestBase", &[]).unwrap();
        let left = Protocol::new("ProtocolTestLeft", &[base]).unwrap();
        let right = Protocol::new("ProtocolTestRight", &[base]).unwrap();
        let both = Protocol::new("ProtocolTestBoth", &[left, right]).unwrap();

        let shared = Selector::from_str("protocolTestShared").unwrap();
        let own = Selector::from_str("protocolTestOwn").unwrap();
        base.add_required(shared).unwrap();
        both.add_required(own).unwrap();
        both.add_optional(Selector::from_str("protocolTestMaybe").unwrap()).unwrap();

        let all = both.all_required();
        assert_eq!(all.len(), 2);
        assert!(all.contains(&shared));
        assert!(all.contains(&own));
        assert!(matches!(
            both.add_optional(own),
            Err(Error::ProtocolMethodAlreadyRegistered { .. })
        ));
    }

    #[test]
    fn test_validate_conformance() {
        let protocol = Protocol::new("ProtocolTestValidate", &[]).unwrap();
        let sel = Selector::from_str("protocolTestRequired").unwrap();
        protocol.add_required(sel).unwrap();

        let class = Class::new_root("ProtocolTestValidator").unwrap();
        assert!(matches!(
            class.validate_protocol_conformance(&protocol),
            Err(Error::MissingProtocolMethod { .. })
        ));
        class.add_method(Method::new(sel, noop)).unwrap();
        assert!(class.validate_protocol_conformance(&protocol).is_ok());
    }

    #[test]
    fn test_class_method_requirements() {
        let base = Protocol::new("ProtocolTestFactoryBase", &[]).unwrap();
        let derived = Protocol::new("ProtocolTestFactory", &[base]).unwrap();
        let make = Selector::from_str("protocolTestMake").unwrap();
        base.add_required_class_method(make).unwrap();
        // Same selector on the instance side is a separate entry
        derived.add_optional(make).unwrap();
        derived
            .add_optional_class_method(Selector::from_str("protocolTestMaybeMake").unwrap())
            .unwrap();
        assert!(matches!(
            base.add_optional_class_method(make),
            Err(Error::ProtocolMethodAlreadyRegistered { .. })
        ));
        assert_eq!(derived.all_required_class_methods(), vec![make]);
        assert!(derived.all_required().is_empty());

        let class = Class::new_root("ProtocolTestFactoryImpl").unwrap();
        let child = Class::new("ProtocolTestFactoryChild", &class).unwrap();
        assert!(matches!(
            child.validate_protocol_conformance(&derived),
            Err(Error::MissingProtocolMethod { .. })
        ));
        class.add_class_method(Method::new(make, noop)).unwrap();
        assert!(child.validate_protocol_conformance(&derived).is_ok());
        assert!(child.metaclass().validate_protocol_conformance(&derived).is_ok());
    }
}
