// Common test utilities for integration tests
//
// Shared fixtures: uniquely named classes, a counter class with an ivar and
// typed methods, and method implementations that record their calls.

#![allow(dead_code)]

use objrt::runtime::message::write_return;
use objrt::{Class, Ivar, MessageArgs, Method, Object, Selector};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Incremented by [`counting_impl`].
pub static CALL_COUNT: AtomicUsize = AtomicUsize::new(0);

static NAME_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Returns `prefix` with a process-wide unique suffix.
pub fn unique_name(prefix: &str) -> String {
    format!("{}_{}", prefix, NAME_SEQ.fetch_add(1, Ordering::SeqCst))
}

/// Creates a root class under a unique name derived from `prefix`.
pub fn create_test_class(prefix: &str) -> Class {
    Class::new_root(&unique_name(prefix)).expect("Failed to create test class")
}

pub fn selector(name: &str) -> Selector {
    Selector::from_str(name).expect("Failed to create test selector")
}

pub fn typed_method(name: &str, types: &str, imp: objrt::Imp) -> Method {
    Method::new(selector(name), imp)
        .with_types(types)
        .expect("Failed to create test method")
}

pub fn void_impl(_obj: &Object, _sel: &Selector, _args: &MessageArgs, _ret: &mut [u8]) {}

pub fn counting_impl(_obj: &Object, _sel: &Selector, _args: &MessageArgs, _ret: &mut [u8]) {
    CALL_COUNT.fetch_add(1, Ordering::SeqCst);
}

pub fn return_42_impl(_obj: &Object, _sel: &Selector, _args: &MessageArgs, ret: &mut [u8]) {
    write_return(ret, 42usize);
}

fn count_ivar(obj: &Object) -> Ivar {
    obj.class().ivar("count").expect("counter ivar missing")
}

/// `increment`: adds one to the `count` ivar.
pub fn increment_impl(obj: &Object, _sel: &Selector, _args: &MessageArgs, _ret: &mut [u8]) {
    let ivar = count_ivar(obj);
    // Callers serialize concurrent increments with `synchronized`
    unsafe {
        let value: u64 = obj.get_ivar(&ivar).unwrap();
        obj.set_ivar(&ivar, value + 1).unwrap();
    }
}

/// `value`: returns the `count` ivar.
pub fn value_impl(obj: &Object, _sel: &Selector, _args: &MessageArgs, ret: &mut [u8]) {
    let ivar = count_ivar(obj);
    let value: u64 = unsafe { obj.get_ivar(&ivar).unwrap() };
    write_return(ret, value as usize);
}

/// A class with a `count` ivar and typed `increment`/`value` methods.
pub fn counter_class(prefix: &str) -> Class {
    let class = Class::allocate(None, &unique_name(prefix), 0).unwrap();
    class.add_ivar("count", "Q").unwrap();
    class.register().unwrap();
    class
        .add_method(typed_method("increment", "v@:", increment_impl))
        .unwrap();
    class.add_method(typed_method("value", "Q@:", value_impl)).unwrap();
    class
}
