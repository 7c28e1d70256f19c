//! Reporting collections mutated while being enumerated.
//!
//! Enumerators call [`enumeration_mutation`] when they notice that the
//! collection changed under them. An installed handler decides what happens;
//! without one the mutation raises [`Error::EnumerationMutated`].

use crate::error::Error;
use crate::runtime::exception::raise;
use crate::runtime::object::Object;
use objrt_log::debug;
use parking_lot::RwLock;

/// Called with the collection that was mutated.
pub type EnumerationMutationHandler = fn(&Object);

static MUTATION_HANDLER: RwLock<Option<EnumerationMutationHandler>> = RwLock::new(None);

/// Installs (or with `None`, removes) the enumeration mutation handler,
/// returning the previous one.
pub fn set_enumeration_mutation_handler(
    handler: Option<EnumerationMutationHandler>,
) -> Option<EnumerationMutationHandler> {
    std::mem::replace(&mut *MUTATION_HANDLER.write(), handler)
}

/// Reports that `object` was mutated during enumeration.
///
/// # Panics
///
/// With no handler installed this raises [`Error::EnumerationMutated`],
/// which unwinds to the nearest [`try_catch`](crate::runtime::exception::try_catch).
pub fn enumeration_mutation(object: &Object) {
    let handler = *MUTATION_HANDLER.read();
    match handler {
        Some(handler) => handler(object),
        None => {
            debug!("{:?} mutated during enumeration", object);
            raise(Error::EnumerationMutated {
                class: object.class().name().to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::class::Class;
    use crate::runtime::exception::try_catch;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static REPORTED: AtomicUsize = AtomicUsize::new(0);

    fn count_mutation(_object: &Object) {
        REPORTED.fetch_add(1, Ordering::SeqCst);
    }

    // One test owns the global handler for its whole run
    #[test]
    fn test_mutation_handler_and_default() {
        let class = Class::new_root("EnumerationTestList").unwrap();
        let list = Object::new(&class).unwrap();

        let caught = try_catch(|| enumeration_mutation(&list));
        assert_eq!(
            caught.unwrap_err().error(),
            Some(&Error::EnumerationMutated {
                class: "EnumerationTestList".into()
            })
        );

        assert!(set_enumeration_mutation_handler(Some(count_mutation)).is_none());
        enumeration_mutation(&list);
        enumeration_mutation(&list);
        assert_eq!(REPORTED.load(Ordering::SeqCst), 2);

        let previous = set_enumeration_mutation_handler(None);
        assert_eq!(previous.map(|h| h as usize), Some(count_mutation as usize));
        assert!(try_catch(|| enumeration_mutation(&list)).is_err());
        assert_eq!(list.retain_count(), 1);
    }
}
