// Dispatch Integration Tests
//
// Resolution order across inheritance and categories, cache invalidation
// after first use, super sends, type initialization and introspection.

mod common;

use objrt::runtime::message::write_return;
use objrt::{
    Category, Class, Error, MessageArgs, Method, Object, Protocol, Selector, send_class_message,
    send_message, send_super,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock, mpsc};
use std::thread;
use std::time::Duration;

fn returns_1(_obj: &Object, _sel: &Selector, _args: &MessageArgs, ret: &mut [u8]) {
    write_return(ret, 1usize);
}

fn returns_2(_obj: &Object, _sel: &Selector, _args: &MessageArgs, ret: &mut [u8]) {
    write_return(ret, 2usize);
}

fn returns_3(_obj: &Object, _sel: &Selector, _args: &MessageArgs, ret: &mut [u8]) {
    write_return(ret, 3usize);
}

fn send(obj: &Object, sel: &Selector) -> Option<usize> {
    send_message(obj, sel, &MessageArgs::None).unwrap()
}

#[test]
fn test_most_derived_wins() {
    let root = common::create_test_class("DerivedRoot");
    let middle = Class::new(&common::unique_name("DerivedMiddle"), &root).unwrap();
    let leaf = Class::new(&common::unique_name("DerivedLeaf"), &middle).unwrap();
    let sel = common::selector("derivedWho");

    root.add_method(Method::new(sel, returns_1)).unwrap();
    middle.add_method(Method::new(sel, returns_2)).unwrap();

    assert_eq!(send(&Object::new(&root).unwrap(), &sel), Some(1));
    assert_eq!(send(&Object::new(&middle).unwrap(), &sel), Some(2));
    assert_eq!(send(&Object::new(&leaf).unwrap(), &sel), Some(2));

    leaf.add_method(Method::new(sel, returns_3)).unwrap();
    assert_eq!(send(&Object::new(&leaf).unwrap(), &sel), Some(3));
}

#[test]
fn test_category_after_first_dispatch() {
    let class = common::create_test_class("CategoryLate");
    let sel = common::selector("categoryLate");
    class.add_method(Method::new(sel, returns_1)).unwrap();

    let obj = Object::new(&class).unwrap();
    assert_eq!(send(&obj, &sel), Some(1));

    let category = Category::new("Override");
    category.add_method(Method::new(sel, returns_2)).unwrap();
    class.add_category(&category).unwrap();
    assert_eq!(send(&obj, &sel), Some(2));

    // Methods added to an attached category are visible too
    let extra = common::selector("categoryLateExtra");
    category.add_method(Method::new(extra, returns_3)).unwrap();
    assert_eq!(send(&obj, &extra), Some(3));

    assert!(matches!(
        class.add_category(&category),
        Err(Error::CategoryAlreadyAttached { .. })
    ));
}

#[test]
fn test_replace_method_invalidates_subclasses() {
    let parent = common::create_test_class("ReplaceParent");
    let child = Class::new(&common::unique_name("ReplaceChild"), &parent).unwrap();
    let sel = common::selector("replaceMe");
    parent.add_method(Method::new(sel, returns_1)).unwrap();

    let obj = Object::new(&child).unwrap();
    assert_eq!(send(&obj, &sel), Some(1));

    let previous = parent.replace_method(Method::new(sel, returns_2)).unwrap();
    assert_eq!(previous.map(|imp| imp as usize), Some(returns_1 as usize));
    assert_eq!(send(&obj, &sel), Some(2));
}

#[test]
fn test_concurrent_dispatch_during_invalidation() {
    let class = common::create_test_class("ConcurrentInvalidation");
    let sel = common::selector("concurrentValue");
    class.add_method(Method::new(sel, returns_1)).unwrap();
    let obj = Object::new(&class).unwrap();

    let senders: Vec<_> = (0..4)
        .map(|_| {
            let obj = obj.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    let value = send(&obj, &sel).unwrap();
                    assert!(value == 1 || value == 2);
                }
            })
        })
        .collect();

    for i in 0..50 {
        let imp = if i % 2 == 0 { returns_2 } else { returns_1 };
        class.replace_method(Method::new(sel, imp)).unwrap();
    }
    for sender in senders {
        sender.join().unwrap();
    }
}

fn super_chain(obj: &Object, sel: &Selector, args: &MessageArgs, ret: &mut [u8]) {
    let child = Class::lookup("SuperChainChild").unwrap();
    let inherited = send_super(obj, &child, sel, args).unwrap().unwrap_or(0);
    write_return(ret, inherited + 10);
}

#[test]
fn test_send_super_chain() {
    let parent = Class::new_root("SuperChainParent").unwrap();
    let child = Class::new("SuperChainChild", &parent).unwrap();
    let sel = common::selector("superChain");
    parent.add_method(Method::new(sel, returns_1)).unwrap();
    child.add_method(Method::new(sel, super_chain)).unwrap();

    let obj = Object::new(&child).unwrap();
    assert_eq!(send(&obj, &sel), Some(11));
    assert!(matches!(
        send_super(&obj, &parent, &sel, &MessageArgs::None),
        Err(Error::UnrecognizedSelector { .. })
    ));
}

static INIT_ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
static INIT_CALLS: AtomicUsize = AtomicUsize::new(0);

fn record_init(class: &Class) {
    INIT_CALLS.fetch_add(1, Ordering::SeqCst);
    INIT_ORDER.lock().unwrap().push(class.name());
}

#[test]
fn test_initializers_run_once_superclass_first() {
    let parent = Class::new_root("InitOrderParent").unwrap();
    let child = Class::new("InitOrderChild", &parent).unwrap();
    parent.set_initializer(record_init);
    child.set_initializer(record_init);
    assert!(!child.is_initialized());

    let handles: Vec<_> = (0..8)
        .map(|_| thread::spawn(move || drop(Object::new(&child).unwrap())))
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(child.is_initialized());
    assert!(parent.is_initialized());
    assert_eq!(INIT_CALLS.load(Ordering::SeqCst), 2);
    assert_eq!(
        *INIT_ORDER.lock().unwrap(),
        vec!["InitOrderParent", "InitOrderChild"]
    );
}

#[test]
fn test_registry_and_introspection() {
    let name = common::unique_name("Registry");
    let class = Class::allocate(None, &name, 0).unwrap();
    assert_eq!(Class::lookup(&name), None);
    assert!(matches!(Class::required(&name), Err(Error::ClassNotFound { .. })));

    class.register().unwrap();
    assert_eq!(Class::lookup(&name), Some(class));
    assert!(Class::all_classes().contains(&class));
    assert!(matches!(
        Class::new_root(&name),
        Err(Error::ClassAlreadyExists { .. })
    ));

    let sel = Selector::with_types("registryLookup", "Q@:").unwrap();
    class.add_method(Method::new(sel, returns_1)).unwrap();
    assert!(class.responds_to(&sel));
    assert_eq!(class.method_type_encoding(&sel), Some("Q@:"));
    assert!(matches!(
        class.add_method(Method::new(sel, returns_2)),
        Err(Error::MethodAlreadyExists { .. })
    ));
}

#[test]
fn test_protocol_conformance_through_category() {
    let parent = Protocol::new("DispatchTestParentProtocol", &[]).unwrap();
    let child = Protocol::new("DispatchTestChildProtocol", &[parent]).unwrap();
    let other = Protocol::new("DispatchTestOtherProtocol", &[]).unwrap();

    let class = common::create_test_class("Conformer");
    let subclass = Class::new(&common::unique_name("ConformerChild"), &class).unwrap();
    assert!(!subclass.conforms_to(&parent));

    let category = Category::new("Adoption");
    category.add_protocol(&child).unwrap();
    class.add_category(&category).unwrap();

    assert!(subclass.conforms_to(&parent));
    assert!(subclass.conforms_to(&child));
    assert!(!subclass.conforms_to(&other));
}

#[test]
fn test_argument_count_checked() {
    let class = common::create_test_class("ArgCount");
    class
        .add_method(common::typed_method("argCountTwo:with:", "v@:qq", common::void_impl))
        .unwrap();
    let obj = Object::new(&class).unwrap();
    let sel = common::selector("argCountTwo:with:");

    assert_eq!(send_message(&obj, &sel, &MessageArgs::two(1, 2)).unwrap(), None);
    assert!(matches!(
        send_message(&obj, &sel, &MessageArgs::one(1)),
        Err(Error::ArgumentCountMismatch { expected: 2, got: 1 })
    ));
}

#[test]
fn test_table_built_before_registration_sees_ancestor_edits() {
    let root = common::create_test_class("PreRegisterRoot");
    let child = Class::allocate(Some(&root), &common::unique_name("PreRegisterChild"), 0).unwrap();
    let sel = common::selector("preRegisterInherited");

    // Builds the child's table while it is still unregistered
    assert!(!child.responds_to(&sel));
    root.add_method(Method::new(sel, returns_2)).unwrap();
    assert!(child.responds_to(&sel));

    child.register().unwrap();
    assert_eq!(send(&Object::new(&child).unwrap(), &sel), Some(2));
    assert_eq!(root.subclasses(), vec![child]);
}

static CROSS_INIT_CHILD: OnceLock<Class> = OnceLock::new();

fn root_init_allocates_child(_class: &Class) {
    thread::sleep(Duration::from_millis(100));
    if let Some(child) = CROSS_INIT_CHILD.get() {
        drop(Object::new(child).unwrap());
    }
}

#[test]
fn test_cross_class_initializers_do_not_deadlock() {
    let root = common::create_test_class("CrossInitRoot");
    let child = Class::new(&common::unique_name("CrossInitChild"), &root).unwrap();
    CROSS_INIT_CHILD.set(child).unwrap();
    root.set_initializer(root_init_allocates_child);

    let (done, finished) = mpsc::channel();
    let root_done = done.clone();
    thread::spawn(move || {
        root.ensure_initialized();
        root_done.send("root").unwrap();
    });
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        child.ensure_initialized();
        done.send("child").unwrap();
    });

    for _ in 0..2 {
        finished
            .recv_timeout(Duration::from_secs(10))
            .expect("class initialization deadlocked");
    }
    assert!(root.is_initialized());
    assert!(child.is_initialized());
}

fn receiver_is_class_object(obj: &Object, _sel: &Selector, _args: &MessageArgs, ret: &mut [u8]) {
    let class = obj.class();
    write_return(ret, usize::from(class.is_meta() && class.instance_class().class_object().is_ok()));
}

fn child_factory(obj: &Object, sel: &Selector, args: &MessageArgs, ret: &mut [u8]) {
    let meta = Class::lookup("ClassSideChild").unwrap().metaclass();
    let inherited = send_super(obj, &meta, sel, args).unwrap().unwrap_or(0);
    write_return(ret, inherited + 10);
}

static CLASS_SIDE_INITS: AtomicUsize = AtomicUsize::new(0);

fn count_class_side_init(_class: &Class) {
    CLASS_SIDE_INITS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn test_class_methods() {
    let root = Class::new_root("ClassSideRoot").unwrap();
    let child = Class::new("ClassSideChild", &root).unwrap();
    let make = common::selector("classSideMake");
    let describe = common::selector("classSideDescribe");
    let who = common::selector("classSideWho");
    root.set_initializer(count_class_side_init);

    assert!(child.metaclass().is_meta());
    assert_eq!(child.metaclass().superclass(), Some(root.metaclass()));
    assert_eq!(root.metaclass().superclass(), Some(root));
    assert_eq!(child.metaclass().metaclass(), root.metaclass());
    assert_eq!(child.metaclass().instance_class(), child);
    assert_eq!(root.metaclass().subclasses(), vec![child.metaclass()]);

    root.add_class_method(Method::new(make, returns_1)).unwrap();
    root.add_class_method(Method::new(who, receiver_is_class_object)).unwrap();
    root.add_method(Method::new(describe, returns_3)).unwrap();

    // The first class message runs the initializer
    assert_eq!(CLASS_SIDE_INITS.load(Ordering::SeqCst), 0);
    assert_eq!(send_class_message(&child, &make, &MessageArgs::None).unwrap(), Some(1));
    assert_eq!(CLASS_SIDE_INITS.load(Ordering::SeqCst), 1);
    assert_eq!(send_class_message(&child, &who, &MessageArgs::None).unwrap(), Some(1));

    // Class objects answer the root's instance methods
    assert_eq!(send_class_message(&child, &describe, &MessageArgs::None).unwrap(), Some(3));

    // Instances do not see class methods
    let instance = Object::new(&child).unwrap();
    assert!(matches!(
        send_message(&instance, &make, &MessageArgs::None),
        Err(Error::UnrecognizedSelector { .. })
    ));

    child.add_class_method(Method::new(make, child_factory)).unwrap();
    assert_eq!(send_class_message(&child, &make, &MessageArgs::None).unwrap(), Some(11));
    assert_eq!(send_class_message(&root, &make, &MessageArgs::None).unwrap(), Some(1));

    // Category class methods land on the metaclass after first use
    let late = common::selector("classSideLate");
    let category = Category::new("ClassSideExtras");
    child.add_category(&category).unwrap();
    category.add_class_method(Method::new(late, returns_2)).unwrap();
    assert_eq!(send_class_message(&child, &late, &MessageArgs::None).unwrap(), Some(2));
    assert!(!instance.responds_to(&late));

    assert_eq!(child.class_methods().len(), 1);
    assert!(child.responds_to_class_method(&describe));
    assert!(!Class::all_classes().contains(&child.metaclass()));
}

#[test]
fn test_class_message_before_registration() {
    let pending = Class::allocate(None, &common::unique_name("ClassSidePending"), 0).unwrap();
    let sel = common::selector("classSidePending");
    pending.add_class_method(Method::new(sel, returns_1)).unwrap();

    assert!(matches!(
        send_class_message(&pending, &sel, &MessageArgs::None),
        Err(Error::ClassNotRegistered { .. })
    ));
    pending.register().unwrap();
    assert_eq!(send_class_message(&pending, &sel, &MessageArgs::None).unwrap(), Some(1));
}
